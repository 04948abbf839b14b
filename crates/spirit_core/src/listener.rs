//! crates/spirit_core/src/listener.rs
//!
//! The change-notification listener. Opens one realtime channel per collection
//! (optionally scoped), validates every raw change into a typed `ChangeEvent`, and
//! hands it to the registered handler.
//!
//! Handlers run in two parts: `on_change` executes synchronously in delivery
//! order, and the future it may return (typically an enrichment fetch) is spawned,
//! so later notifications are processed while that fetch is in flight.
//!
//! A channel error or timeout is terminal for that channel. The listener drops
//! it from its registry and reports the failure through `Subscription::closed`;
//! resubscribing is up to the owner.

use crate::domain::{
    ChangeEvent, ChangeKind, ChannelMessage, ChannelSpec, ChannelStatus, Collection, RawChange,
    Row,
};
use crate::ports::{ChannelStream, PortError, PortResult, RealtimeTransport};
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives typed change events for one channel.
pub trait ChangeHandler: Send + Sync + 'static {
    /// Runs synchronously in delivery order. Returns follow-up work that may
    /// interleave with later notifications.
    fn on_change(&self, event: ChangeEvent) -> Option<BoxFuture<'static, ()>>;
}

impl<F> ChangeHandler for F
where
    F: Fn(ChangeEvent) -> Option<BoxFuture<'static, ()>> + Send + Sync + 'static,
{
    fn on_change(&self, event: ChangeEvent) -> Option<BoxFuture<'static, ()>> {
        self(event)
    }
}

/// Why a channel stopped delivering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnd {
    /// The subscription was disposed by its owner.
    Disposed,
    /// The transport reported an error or timeout.
    Failed(String),
    /// The transport closed the stream.
    Ended,
}

type Registry = Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>;

#[derive(Clone)]
pub struct ChangeListener {
    transport: Arc<dyn RealtimeTransport>,
    channels: Registry,
    next_id: Arc<AtomicU64>,
}

impl ChangeListener {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            transport,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Opens the channel described by `spec` and starts delivering to `handler`.
    /// Subscribing again under the same name replaces the earlier channel.
    pub async fn subscribe(
        &self,
        spec: ChannelSpec,
        handler: Arc<dyn ChangeHandler>,
    ) -> PortResult<Subscription> {
        let stream = self.transport.open(&spec).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let replaced = lock(&self.channels).insert(spec.name.clone(), (id, token.clone()));
        if let Some((_, previous)) = replaced {
            debug!(channel = %spec.name, "Replacing existing channel");
            previous.cancel();
        }

        let (end_tx, end_rx) = oneshot::channel();
        let name = spec.name.clone();
        tokio::spawn(run_channel(
            spec,
            stream,
            handler,
            token.clone(),
            self.channels.clone(),
            id,
            end_tx,
        ));

        Ok(Subscription {
            name,
            token,
            end: Some(end_rx),
        })
    }

    /// Names of channels currently delivering.
    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.channels).keys().cloned().collect();
        names.sort();
        names
    }
}

/// Disposer for one channel. Dropping it disposes the channel too.
pub struct Subscription {
    name: String,
    token: CancellationToken,
    end: Option<oneshot::Receiver<ChannelEnd>>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispose(&self) {
        self.token.cancel();
    }

    /// Resolves once the channel stops delivering. Later calls return `Ended`.
    pub async fn closed(&mut self) -> ChannelEnd {
        match self.end.take() {
            Some(rx) => rx.await.unwrap_or(ChannelEnd::Ended),
            None => ChannelEnd::Ended,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_channel(
    spec: ChannelSpec,
    mut stream: ChannelStream,
    handler: Arc<dyn ChangeHandler>,
    token: CancellationToken,
    channels: Registry,
    id: u64,
    end_tx: oneshot::Sender<ChannelEnd>,
) {
    let end = loop {
        tokio::select! {
            _ = token.cancelled() => break ChannelEnd::Disposed,
            message = stream.next() => match message {
                None => break ChannelEnd::Ended,
                Some(ChannelMessage::Status(ChannelStatus::Subscribed)) => {
                    info!(channel = %spec.name, "Channel subscribed");
                }
                Some(ChannelMessage::Status(status)) => {
                    warn!(channel = %spec.name, ?status, "Channel terminated");
                    break match status {
                        ChannelStatus::ChannelError(reason) => ChannelEnd::Failed(reason),
                        ChannelStatus::TimedOut => ChannelEnd::Failed("timed out".to_string()),
                        _ => ChannelEnd::Ended,
                    };
                }
                Some(ChannelMessage::Change(raw)) => match parse_change(&spec, raw) {
                    Ok(Some(event)) => {
                        if let Some(task) = handler.on_change(event) {
                            tokio::spawn(task);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(channel = %spec.name, "Dropping change: {}", e),
                },
            }
        }
    };

    {
        let mut registry = lock(&channels);
        if registry.get(&spec.name).is_some_and(|(current, _)| *current == id) {
            registry.remove(&spec.name);
        }
    }
    let _ = end_tx.send(end);
}

/// Validates a raw change against its channel. `Ok(None)` means the change is
/// well-formed but not for this channel.
pub fn parse_change(spec: &ChannelSpec, raw: RawChange) -> PortResult<Option<ChangeEvent>> {
    let kind: ChangeKind = raw.event_type.parse().map_err(PortError::Decode)?;
    let collection: Collection = raw.table.parse().map_err(PortError::Decode)?;
    if collection != spec.collection {
        return Ok(None);
    }
    let scoped_row = match kind {
        ChangeKind::Delete => raw.old.as_ref(),
        _ => raw.new.as_ref(),
    };
    if !spec.accepts(scoped_row) {
        return Ok(None);
    }
    Ok(Some(ChangeEvent {
        kind,
        collection,
        old: into_row(raw.old)?,
        new: into_row(raw.new)?,
    }))
}

/// Missing, null, and empty rows all mean "no row".
fn into_row(value: Option<serde_json::Value>) -> PortResult<Option<Row>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
        Some(serde_json::Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(PortError::Decode(format!("row is not an object: {}", other))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, FakeTransport};
    use futures::FutureExt;
    use serde_json::json;

    fn recording_handler() -> (Arc<dyn ChangeHandler>, Arc<Mutex<Vec<ChangeEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |event: ChangeEvent| -> Option<BoxFuture<'static, ()>> {
            sink.lock().unwrap().push(event);
            None
        };
        (Arc::new(handler), seen)
    }

    #[tokio::test]
    async fn test_delivers_typed_events_in_order() {
        let transport = Arc::new(FakeTransport::new());
        let listener = ChangeListener::new(transport.clone());
        let (handler, seen) = recording_handler();

        let _sub = listener
            .subscribe(ChannelSpec::for_collection(Collection::Matches), handler)
            .await
            .unwrap();

        transport.push_change("matches", "INSERT", "matches", json!({"id": "a"}), json!({}));
        transport.push_change("matches", "DELETE", "matches", json!({}), json!({"id": "a"}));

        eventually(|| seen.lock().unwrap().len() == 2).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].kind, ChangeKind::Insert);
        assert!(seen[0].old.is_none());
        assert_eq!(seen[1].kind, ChangeKind::Delete);
        assert!(seen[1].new.is_none());
        assert_eq!(seen[1].old.as_ref().unwrap()["id"], json!("a"));
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_changes_are_dropped() {
        let transport = Arc::new(FakeTransport::new());
        let listener = ChangeListener::new(transport.clone());
        let (handler, seen) = recording_handler();

        let _sub = listener
            .subscribe(ChannelSpec::for_collection(Collection::Matches), handler)
            .await
            .unwrap();

        transport.push_change("matches", "TRUNCATE", "matches", json!({}), json!({}));
        transport.push_change("matches", "INSERT", "matches", json!([1, 2]), json!({}));
        transport.push_change("matches", "INSERT", "thoughts", json!({"id": "t"}), json!({}));
        transport.push_change("matches", "UPDATE", "matches", json!({"id": "b"}), json!({}));

        eventually(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0].new.as_ref().unwrap()["id"], json!("b"));
    }

    #[tokio::test]
    async fn test_scoped_channel_filters_rows() {
        let transport = Arc::new(FakeTransport::new());
        let listener = ChangeListener::new(transport.clone());
        let (handler, seen) = recording_handler();
        let spec = ChannelSpec::scoped(Collection::Messages, "conversation_id", "c-1");
        let name = spec.name.clone();

        let _sub = listener.subscribe(spec, handler).await.unwrap();

        let elsewhere = json!({"id": "1", "conversation_id": "c-2"});
        let here = json!({"id": "2", "conversation_id": "c-1"});
        transport.push_change(&name, "INSERT", "messages", elsewhere, json!({}));
        transport.push_change(&name, "INSERT", "messages", here, json!({}));

        eventually(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0].new.as_ref().unwrap()["id"], json!("2"));
    }

    #[tokio::test]
    async fn test_channel_error_is_terminal() {
        let transport = Arc::new(FakeTransport::new());
        let listener = ChangeListener::new(transport.clone());
        let (handler, seen) = recording_handler();

        let mut sub = listener
            .subscribe(ChannelSpec::for_collection(Collection::Thoughts), handler)
            .await
            .unwrap();
        assert_eq!(listener.active_channels(), vec!["thoughts".to_string()]);

        transport.fail_channel("thoughts", "socket reset");
        assert_eq!(sub.closed().await, ChannelEnd::Failed("socket reset".to_string()));
        assert!(listener.active_channels().is_empty());

        // Nothing is delivered after the failure, and nothing resubscribes on its own.
        transport.push_change("thoughts", "INSERT", "thoughts", json!({"id": "x"}), json!({}));
        tokio::task::yield_now().await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(transport.opens("thoughts"), 1);
    }

    #[tokio::test]
    async fn test_dispose_closes_channel() {
        let transport = Arc::new(FakeTransport::new());
        let listener = ChangeListener::new(transport.clone());
        let (handler, _seen) = recording_handler();

        let mut sub = listener
            .subscribe(ChannelSpec::for_collection(Collection::Matches), handler)
            .await
            .unwrap();
        sub.dispose();

        assert_eq!(sub.closed().await, ChannelEnd::Disposed);
        assert!(listener.active_channels().is_empty());
        eventually(|| !transport.is_open("matches")).await;
    }

    #[tokio::test]
    async fn test_returned_work_runs_outside_delivery() {
        let transport = Arc::new(FakeTransport::new());
        let listener = ChangeListener::new(transport.clone());
        let done = Arc::new(Mutex::new(0));
        let counter = done.clone();
        let handler = move |_event: ChangeEvent| -> Option<BoxFuture<'static, ()>> {
            let counter = counter.clone();
            Some(
                async move {
                    *counter.lock().unwrap() += 1;
                }
                .boxed(),
            )
        };

        let _sub = listener
            .subscribe(ChannelSpec::for_collection(Collection::Matches), Arc::new(handler))
            .await
            .unwrap();
        transport.push_change("matches", "UPDATE", "matches", json!({"id": "a"}), json!({}));

        eventually(|| *done.lock().unwrap() == 1).await;
    }

    #[tokio::test]
    async fn test_refused_open_is_reported() {
        let transport = Arc::new(FakeTransport::new());
        transport.refuse_opens(true);
        let listener = ChangeListener::new(transport);
        let (handler, _seen) = recording_handler();

        let result = listener
            .subscribe(ChannelSpec::for_collection(Collection::Matches), handler)
            .await;
        assert!(matches!(result, Err(PortError::ChannelClosed(_))));
    }
}
