//! Streaming endpoint: long-lived SSE connections fed by the broadcast hub,
//! plus the side POST control channel.

use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Query, State},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    routing::{get, post},
};
use deployment::Deployment;
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use services::services::events::{EventService, StreamMessage};
use tokio_stream::wrappers::ReceiverStream;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(alias = "clientId")]
    pub client_id: Option<String>,
    /// Comma-separated channel names; the hub applies its defaults when
    /// omitted.
    pub channels: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: String,
    pub payload: Option<Value>,
    #[serde(alias = "clientId")]
    pub client_id: Option<String>,
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/stream", get(stream))
        .route("/stream/control", post(control))
}

/// SSE stream that deregisters its hub connection when the client goes away.
pub struct ClientEventStream {
    inner: ReceiverStream<StreamMessage>,
    events: EventService,
    client_id: String,
}

impl Stream for ClientEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(message)) => {
                let data =
                    serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
                let event = Event::default().event(message.kind.as_str()).data(data);
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ClientEventStream {
    fn drop(&mut self) {
        self.events.disconnect(&self.client_id);
    }
}

async fn stream(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<KeepAliveStream<ClientEventStream>>, ApiError> {
    let client_id = query
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));
    let channels: Vec<String> = query
        .channels
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let token = query.token.unwrap_or_default();

    let rx = deployment.events().connect(&client_id, channels, &token).await?;
    let stream = ClientEventStream {
        inner: ReceiverStream::new(rx),
        events: deployment.events().clone(),
        client_id,
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

async fn control(
    State(deployment): State<DeploymentImpl>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let events = deployment.events();

    let data = match request.action.as_str() {
        "get_status" => serde_json::to_value(events.status())
            .map_err(|e| ApiError::InternalError(format!("Failed to serialize status: {e}")))?,
        "get_forecasts" => serde_json::to_value(events.insights().current_forecasts())
            .map_err(|e| ApiError::InternalError(format!("Failed to serialize forecasts: {e}")))?,
        "get_alerts" => serde_json::to_value(events.insights().active_alerts())
            .map_err(|e| ApiError::InternalError(format!("Failed to serialize alerts: {e}")))?,
        "inject_data" => {
            let payload = request
                .payload
                .ok_or_else(|| ApiError::BadRequest("payload is required for inject_data".to_string()))?;
            let outcome = events.insights().inject(&payload);
            let delivered = events
                .broadcast_to_channels(&["insights".to_string()], payload)
                .await;
            crate::metrics::STREAM_MESSAGES_PUSHED.inc_by(delivered as u64);
            json!({"outcome": outcome, "delivered": delivered})
        }
        "send_to_client" => {
            let client_id = request.client_id.ok_or_else(|| {
                ApiError::BadRequest("client_id is required for send_to_client".to_string())
            })?;
            let payload = request.payload.unwrap_or(Value::Null);
            events.send_to_client(&client_id, payload).await?;
            crate::metrics::STREAM_MESSAGES_PUSHED.inc();
            json!({"delivered": true, "client_id": client_id})
        }
        "broadcast" => {
            let payload = request.payload.unwrap_or(Value::Null);
            let delivered = events.broadcast_to_all(payload).await;
            crate::metrics::STREAM_MESSAGES_PUSHED.inc_by(delivered as u64);
            json!({"delivered": delivered})
        }
        other => {
            return Err(ApiError::BadRequest(format!("Unknown stream action '{other}'")));
        }
    };

    Ok(Json(ApiResponse::success(data)))
}
