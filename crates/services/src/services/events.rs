//! Event Broadcast Hub.
//!
//! Keeps the registry of live stream connections and their channel
//! subscriptions, pushes messages to per-connection sinks, and runs the
//! heartbeat / dead-connection reaper tasks. A failed write never propagates
//! past the offending connection — it is torn down and everyone else keeps
//! streaming.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, interval},
};
use tokio_util::sync::CancellationToken;
use ts_rs::TS;

use crate::services::{config::StreamSettings, insights::InsightsService};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Client '{0}' is not connected")]
    ClientNotFound(String),
    #[error("Stream authentication is not configured")]
    AuthNotConfigured,
    #[error("Stream token rejected")]
    Unauthorized,
    #[error("Client '{0}' went away mid-write")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum StreamMessageType {
    Connected,
    InitialForecasts,
    InitialAlerts,
    EngineStatus,
    Data,
    Ping,
    Broadcast,
    ChannelMessage,
    Heartbeat,
}

impl StreamMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMessageType::Connected => "connected",
            StreamMessageType::InitialForecasts => "initial_forecasts",
            StreamMessageType::InitialAlerts => "initial_alerts",
            StreamMessageType::EngineStatus => "engine_status",
            StreamMessageType::Data => "data",
            StreamMessageType::Ping => "ping",
            StreamMessageType::Broadcast => "broadcast",
            StreamMessageType::ChannelMessage => "channel_message",
            StreamMessageType::Heartbeat => "heartbeat",
        }
    }
}

/// Wire envelope for every message pushed down a stream connection.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: StreamMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl StreamMessage {
    pub fn new(kind: StreamMessageType, payload: Option<Value>) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Claims carried by a signed stream token.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamClaims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct HubStatus {
    pub connections: usize,
    pub channels: HashMap<String, usize>,
}

struct ClientHandle {
    sender: mpsc::Sender<StreamMessage>,
    channels: HashSet<String>,
    connected_at: DateTime<Utc>,
    heartbeat: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct EventService {
    connections: Arc<DashMap<String, ClientHandle>>,
    subscriptions: Arc<DashMap<String, HashSet<String>>>,
    insights: InsightsService,
    settings: StreamSettings,
    cancel: CancellationToken,
}

impl EventService {
    pub fn new(insights: InsightsService, settings: StreamSettings) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            insights,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn insights(&self) -> &InsightsService {
        &self.insights
    }

    fn verify_token(&self, token: &str) -> Result<StreamClaims, EventError> {
        let secret = self
            .settings
            .auth_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(EventError::AuthNotConfigured)?;
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<StreamClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|_| EventError::Unauthorized)
    }

    /// Register a new stream connection. Sends the `connected` ack plus the
    /// bootstrap burst before handing the receiver back, so the client has a
    /// complete view without a separate request.
    pub async fn connect(
        &self,
        client_id: &str,
        channels: Vec<String>,
        token: &str,
    ) -> Result<mpsc::Receiver<StreamMessage>, EventError> {
        self.verify_token(token)?;

        let channels: HashSet<String> = if channels.is_empty() {
            self.settings.default_channels.iter().cloned().collect()
        } else {
            channels.into_iter().collect()
        };

        // A reconnect under the same id replaces the stale registration.
        self.disconnect(client_id);

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        self.connections.insert(
            client_id.to_string(),
            ClientHandle {
                sender: tx.clone(),
                channels: channels.clone(),
                connected_at: Utc::now(),
                heartbeat: None,
            },
        );
        for channel in &channels {
            self.subscriptions
                .entry(channel.clone())
                .or_default()
                .insert(client_id.to_string());
        }
        self.insights.subscribe();

        let mut sorted_channels: Vec<&String> = channels.iter().collect();
        sorted_channels.sort();
        let burst = [
            StreamMessage::new(
                StreamMessageType::Connected,
                Some(json!({"client_id": client_id, "channels": sorted_channels})),
            ),
            StreamMessage::new(
                StreamMessageType::InitialForecasts,
                serde_json::to_value(self.insights.current_forecasts()).ok(),
            ),
            StreamMessage::new(
                StreamMessageType::InitialAlerts,
                serde_json::to_value(self.insights.active_alerts()).ok(),
            ),
            StreamMessage::new(
                StreamMessageType::EngineStatus,
                serde_json::to_value(self.insights.status()).ok(),
            ),
        ];
        for message in burst {
            if tx.send(message).await.is_err() {
                self.disconnect(client_id);
                return Err(EventError::Closed(client_id.to_string()));
            }
        }

        let heartbeat = self.spawn_heartbeat(client_id.to_string());
        if let Some(mut handle) = self.connections.get_mut(client_id) {
            handle.heartbeat = Some(heartbeat);
        } else {
            heartbeat.abort();
        }

        tracing::info!(
            "Stream client {} connected on {} channel(s)",
            client_id,
            channels.len()
        );
        Ok(rx)
    }

    fn spawn_heartbeat(&self, client_id: String) -> JoinHandle<()> {
        let service = self.clone();
        let period = Duration::from_secs(self.settings.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sender = match service.connections.get(&client_id) {
                            Some(handle) => handle.sender.clone(),
                            None => break,
                        };
                        if sender
                            .send(StreamMessage::new(StreamMessageType::Ping, None))
                            .await
                            .is_err()
                        {
                            service.disconnect(&client_id);
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Tear down one connection: heartbeat cancelled, sink dropped, both
    /// registries cleaned, upstream engine unsubscribed.
    pub fn disconnect(&self, client_id: &str) {
        if let Some((_, handle)) = self.connections.remove(client_id) {
            if let Some(heartbeat) = handle.heartbeat {
                heartbeat.abort();
            }
            for channel in &handle.channels {
                if let Some(mut subscribers) = self.subscriptions.get_mut(channel) {
                    subscribers.remove(client_id);
                }
            }
            drop(handle.sender);
            self.insights.unsubscribe();
            tracing::info!("Stream client {} disconnected", client_id);
        }
    }

    pub async fn send_to_client(&self, client_id: &str, payload: Value) -> Result<(), EventError> {
        let sender = self
            .connections
            .get(client_id)
            .map(|handle| handle.sender.clone())
            .ok_or_else(|| EventError::ClientNotFound(client_id.to_string()))?;

        if sender
            .send(StreamMessage::new(StreamMessageType::Data, Some(payload)))
            .await
            .is_err()
        {
            self.disconnect(client_id);
            return Err(EventError::Closed(client_id.to_string()));
        }
        Ok(())
    }

    /// Push to every connection. Returns the number of successful deliveries.
    pub async fn broadcast_to_all(&self, payload: Value) -> usize {
        let targets: Vec<(String, mpsc::Sender<StreamMessage>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().sender.clone()))
            .collect();

        self.deliver(targets, StreamMessageType::Broadcast, payload)
            .await
    }

    /// Push only to connections whose subscriptions intersect `channels`.
    pub async fn broadcast_to_channels(&self, channels: &[String], payload: Value) -> usize {
        let mut eligible: HashSet<String> = HashSet::new();
        for channel in channels {
            if let Some(subscribers) = self.subscriptions.get(channel) {
                eligible.extend(subscribers.iter().cloned());
            }
        }

        let targets: Vec<(String, mpsc::Sender<StreamMessage>)> = eligible
            .into_iter()
            .filter_map(|client_id| {
                self.connections
                    .get(&client_id)
                    .map(|handle| (client_id, handle.sender.clone()))
            })
            .collect();

        let wrapped = json!({"channels": channels, "data": payload});
        self.deliver(targets, StreamMessageType::ChannelMessage, wrapped)
            .await
    }

    async fn deliver(
        &self,
        targets: Vec<(String, mpsc::Sender<StreamMessage>)>,
        kind: StreamMessageType,
        payload: Value,
    ) -> usize {
        let mut delivered = 0;
        for (client_id, sender) in targets {
            let message = StreamMessage::new(kind, Some(payload.clone()));
            if sender.send(message).await.is_ok() {
                delivered += 1;
            } else {
                self.disconnect(&client_id);
            }
        }
        delivered
    }

    /// Background sweep probing every connection with a zero-cost heartbeat
    /// write and reaping the ones that fail.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let service = self.clone();
        let period = Duration::from_secs(self.settings.reaper_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let targets: Vec<(String, mpsc::Sender<StreamMessage>)> = service
                            .connections
                            .iter()
                            .map(|entry| (entry.key().clone(), entry.value().sender.clone()))
                            .collect();
                        let mut reaped = 0;
                        for (client_id, sender) in targets {
                            if sender
                                .send(StreamMessage::new(StreamMessageType::Heartbeat, None))
                                .await
                                .is_err()
                            {
                                service.disconnect(&client_id);
                                reaped += 1;
                            }
                        }
                        if reaped > 0 {
                            tracing::info!("Reaped {} dead stream connections", reaped);
                        }
                    }
                }
            }
        })
    }

    /// Stop the heartbeat and reaper tasks. Used for clean process shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn status(&self) -> HubStatus {
        let channels = self
            .subscriptions
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        HubStatus {
            connections: self.connections.len(),
            channels,
        }
    }

    pub fn connected_since(&self, client_id: &str) -> Option<DateTime<Utc>> {
        self.connections
            .get(client_id)
            .map(|handle| handle.connected_at)
    }
}
