//! crates/spirit_core/src/feed.rs
//!
//! `MatchFeed` owns one reconciled view of the community feed. It wires the
//! pieces together in order: the session answers who is looking, the bootstrap
//! fetcher loads everything visible to them, and realtime channels for matches,
//! participants and thoughts feed the reconciler from then on.
//!
//! The feed reloads when the session is restored or the user changes, and
//! resubscribes failed channels with a bounded exponential backoff, reloading
//! after each successful resubscription to pick up anything missed meanwhile.

use crate::bootstrap::{BootstrapFetcher, FeedSnapshot};
use crate::domain::{ChannelSpec, Collection, EventRecord, FeedAggregates, MatchRecord};
use crate::listener::{ChannelEnd, ChangeHandler, ChangeListener};
use crate::ports::{RealtimeTransport, RemoteStore};
use crate::reconciler::{MatchReconciler, ReconcilerOptions};
use crate::session::{SessionSignal, SessionStore};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Collections whose changes the feed reconciles.
pub const FEED_COLLECTIONS: [Collection; 3] = [
    Collection::Matches,
    Collection::MatchParticipants,
    Collection::Thoughts,
];

/// External collaborators of the feed.
#[derive(Clone)]
pub struct FeedDeps {
    pub store: Arc<dyn RemoteStore>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub session: Arc<SessionStore>,
}

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub reconciler: ReconcilerOptions,
    /// Resubscription attempts per channel before giving up on it.
    pub resubscribe_attempts: u32,
    /// Delay before the first resubscription; doubles on each further attempt.
    pub resubscribe_backoff: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerOptions::default(),
            resubscribe_attempts: 3,
            resubscribe_backoff: Duration::from_millis(500),
        }
    }
}

/// The non-match parts of the last load.
#[derive(Debug, Default)]
struct FeedView {
    events: Vec<EventRecord>,
    aggregates: FeedAggregates,
    errors: Vec<String>,
}

struct FeedInner {
    session: Arc<SessionStore>,
    fetcher: BootstrapFetcher,
    listener: ChangeListener,
    reconciler: MatchReconciler,
    view: RwLock<FeedView>,
    options: FeedOptions,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct MatchFeed {
    inner: Arc<FeedInner>,
}

impl MatchFeed {
    /// Performs the initial load, then attaches realtime channels and the
    /// session watcher. Load failures surface through `errors()`.
    pub async fn start(deps: FeedDeps, options: FeedOptions) -> Self {
        let reconciler = MatchReconciler::new(
            deps.store.clone(),
            deps.session.clone(),
            options.reconciler.clone(),
        );
        let feed = Self {
            inner: Arc::new(FeedInner {
                session: deps.session,
                fetcher: BootstrapFetcher::new(deps.store),
                listener: ChangeListener::new(deps.transport),
                reconciler,
                view: RwLock::new(FeedView::default()),
                options,
                shutdown: CancellationToken::new(),
            }),
        };

        feed.reload().await;
        for collection in FEED_COLLECTIONS {
            tokio::spawn(feed.clone().supervise_channel(ChannelSpec::for_collection(collection)));
        }
        let signals = feed.inner.session.signals();
        tokio::spawn(feed.clone().watch_session(signals));
        feed
    }

    //-------------------------------------------------------------------------------------
    // Reads
    //-------------------------------------------------------------------------------------

    pub fn matches(&self) -> Vec<MatchRecord> {
        self.inner.reconciler.snapshot()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.view().events.clone()
    }

    pub fn aggregates(&self) -> FeedAggregates {
        self.view().aggregates.clone()
    }

    /// Human-readable failures from the last load, for the UI to render.
    pub fn errors(&self) -> Vec<String> {
        self.view().errors.clone()
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.inner.session
    }

    pub fn reconciler(&self) -> &MatchReconciler {
        &self.inner.reconciler
    }

    pub fn active_channels(&self) -> Vec<String> {
        self.inner.listener.active_channels()
    }

    //-------------------------------------------------------------------------------------
    // Lifecycle
    //-------------------------------------------------------------------------------------

    /// Full reload for the current viewer. Changes reconciled while the load
    /// is in flight win over the loaded snapshot.
    pub async fn reload(&self) {
        let viewer = self.inner.session.current_user_id();
        let ticket = self.inner.reconciler.begin_load();
        let FeedSnapshot {
            events,
            matches,
            aggregates,
            errors,
        } = self.inner.fetcher.load_all(viewer).await;
        if self.is_shut_down() {
            return;
        }

        self.inner.reconciler.replace_all(matches, ticket);
        let mut view = self.inner.view.write().unwrap_or_else(PoisonError::into_inner);
        *view = FeedView {
            events,
            aggregates,
            errors,
        };
    }

    /// Disposes every channel; in-flight fetches complete into nothing.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.reconciler.teardown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn supervise_channel(self, spec: ChannelSpec) {
        let handler: Arc<dyn ChangeHandler> = Arc::new(self.inner.reconciler.clone());
        let shutdown = self.inner.shutdown.clone();
        let mut failures = 0u32;

        loop {
            match self.inner.listener.subscribe(spec.clone(), handler.clone()).await {
                Ok(mut subscription) => {
                    if failures > 0 {
                        info!(channel = %spec.name, "Resubscribed, reloading feed");
                        self.reload().await;
                    }
                    let opened = Instant::now();
                    let end = tokio::select! {
                        _ = shutdown.cancelled() => {
                            subscription.dispose();
                            return;
                        }
                        end = subscription.closed() => end,
                    };
                    match end {
                        ChannelEnd::Disposed => return,
                        ChannelEnd::Failed(reason) => {
                            warn!(channel = %spec.name, %reason, "Channel failed");
                        }
                        ChannelEnd::Ended => warn!(channel = %spec.name, "Channel ended"),
                    }
                    // A channel that stayed up through the longest backoff earns a fresh budget.
                    if failures > 0 && opened.elapsed() >= self.longest_backoff() {
                        debug!(channel = %spec.name, "Channel was stable, resetting attempts");
                        failures = 0;
                    }
                }
                Err(e) => warn!(channel = %spec.name, "Could not subscribe: {}", e),
            }

            failures += 1;
            if failures > self.inner.options.resubscribe_attempts {
                error!(channel = %spec.name, attempts = failures - 1, "Giving up on channel");
                return;
            }
            let delay =
                self.inner.options.resubscribe_backoff * 2u32.saturating_pow(failures - 1);
            info!(channel = %spec.name, attempt = failures, ?delay, "Resubscribing");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn longest_backoff(&self) -> Duration {
        let attempts = self.inner.options.resubscribe_attempts.max(1);
        self.inner.options.resubscribe_backoff * 2u32.saturating_pow(attempts - 1)
    }

    async fn watch_session(self, mut signals: broadcast::Receiver<SessionSignal>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let signal = tokio::select! {
                _ = shutdown.cancelled() => return,
                signal = signals.recv() => signal,
            };
            match signal {
                Ok(SessionSignal::Restored) => {
                    info!("Session restored, reloading feed");
                    self.reload().await;
                }
                Ok(SessionSignal::UserChanged(user_id)) => {
                    info!(?user_id, "Viewer changed, reloading feed");
                    self.reload().await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed session signals, reloading feed");
                    self.reload().await;
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    fn view(&self) -> std::sync::RwLockReadGuard<'_, FeedView> {
        self.inner.view.read().unwrap_or_else(PoisonError::into_inner)
    }
}
