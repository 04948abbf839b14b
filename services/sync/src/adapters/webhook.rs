//! services/sync/src/adapters/webhook.rs
//!
//! An adapter that implements the `RealtimeTransport` port on top of database
//! webhooks. The backend POSTs every row change to the service; the web layer
//! hands each payload to `WebhookHub::publish`, which fans it out to every open
//! channel. Channels filter by collection (and scope) in the core listener.
//!
//! A channel that falls behind the broadcast buffer reports a channel error and
//! ends. The feed then resubscribes and reloads, which recovers the missed rows.

use async_stream::stream;
use async_trait::async_trait;
use serde::Deserialize;
use spirit_core::domain::{ChannelMessage, ChannelSpec, ChannelStatus, RawChange};
use spirit_core::ports::{ChannelStream, PortResult, RealtimeTransport};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use utoipa::ToSchema;

const DEFAULT_CAPACITY: usize = 1024;

/// The body of one database webhook delivery.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct WebhookPayload {
    /// `INSERT`, `UPDATE` or `DELETE`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub record: Option<serde_json::Value>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub old_record: Option<serde_json::Value>,
}

impl From<WebhookPayload> for RawChange {
    fn from(payload: WebhookPayload) -> Self {
        RawChange {
            event_type: payload.event_type,
            table: payload.table,
            new: payload.record,
            old: payload.old_record,
        }
    }
}

#[derive(Clone)]
pub struct WebhookHub {
    sender: broadcast::Sender<RawChange>,
}

impl WebhookHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fans a change out to every open channel. Returns how many received it.
    pub fn publish(&self, change: RawChange) -> usize {
        // An error only means nobody is listening right now.
        let receivers = self.sender.send(change).unwrap_or(0);
        if receivers == 0 {
            debug!("Webhook change published with no open channels");
        }
        receivers
    }

    pub fn open_channels(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WebhookHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for WebhookHub {
    async fn open(&self, spec: &ChannelSpec) -> PortResult<ChannelStream> {
        let mut receiver = self.sender.subscribe();
        let name = spec.name.clone();

        let messages = stream! {
            yield ChannelMessage::Status(ChannelStatus::Subscribed);
            loop {
                match receiver.recv().await {
                    Ok(change) => yield ChannelMessage::Change(change),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Channel fell behind the webhook feed");
                        yield ChannelMessage::Status(ChannelStatus::ChannelError(format!(
                            "missed {} changes",
                            skipped
                        )));
                        break;
                    }
                    Err(RecvError::Closed) => {
                        yield ChannelMessage::Status(ChannelStatus::Closed);
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(messages))
    }
}
