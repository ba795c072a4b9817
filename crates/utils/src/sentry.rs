use sentry_tracing::SentryLayer;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;

/// Tracing layer that forwards error events and breadcrumbs to Sentry.
/// No-op unless a Sentry client was initialized for the process.
pub fn sentry_layer<S>() -> SentryLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    sentry_tracing::layer()
}
