use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, TextEncoder, register_int_counter};

lazy_static! {
    pub static ref TRANSITIONS_APPLIED: IntCounter = register_int_counter!(
        "pulsehub_transitions_applied_total",
        "Workflow state transitions applied through the API"
    )
    .expect("metric can be registered");
    pub static ref WEBHOOKS_VERIFIED: IntCounter = register_int_counter!(
        "pulsehub_webhooks_verified_total",
        "Inbound webhook deliveries that passed signature verification"
    )
    .expect("metric can be registered");
    pub static ref WEBHOOKS_REJECTED: IntCounter = register_int_counter!(
        "pulsehub_webhooks_rejected_total",
        "Inbound webhook deliveries rejected before processing"
    )
    .expect("metric can be registered");
    pub static ref STREAM_MESSAGES_PUSHED: IntCounter = register_int_counter!(
        "pulsehub_stream_messages_pushed_total",
        "Messages pushed to stream clients via the control channel"
    )
    .expect("metric can be registered");
}

pub fn export_metrics() -> Result<String, prometheus::Error> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_exposition() {
        TRANSITIONS_APPLIED.inc();
        WEBHOOKS_REJECTED.inc();

        let exported = export_metrics().expect("export failed");
        assert!(exported.contains("pulsehub_transitions_applied_total"));
        assert!(exported.contains("pulsehub_webhooks_rejected_total"));
    }
}
