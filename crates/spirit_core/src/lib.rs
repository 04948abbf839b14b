pub mod bootstrap;
pub mod domain;
pub mod enrich;
pub mod feed;
pub mod listener;
pub mod ports;
pub mod reconciler;
pub mod session;
pub mod suppression;
pub mod thoughts;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::{BootstrapFetcher, FeedSnapshot};
pub use domain::{
    AuthEvent, AuthSession, ChangeEvent, ChangeKind, ChannelSpec, Collection, EventRecord,
    FeedAggregates, MatchRecord, Profile, RawChange, Session, TargetKind, ThoughtNode,
    ThoughtRecord, ThoughtTarget,
};
pub use feed::{FeedDeps, FeedOptions, MatchFeed};
pub use listener::{ChangeHandler, ChangeListener, ChannelEnd, Subscription};
pub use ports::{
    ChannelStream, PortError, PortResult, RealtimeTransport, RemoteStore, ScrapeService,
    SessionPersistence,
};
pub use reconciler::{LoadTicket, MatchReconciler, ReconcilerOptions};
pub use session::{AuthTransition, SessionSignal, SessionStore};
pub use thoughts::{build_thought_forest, load_thought_forest, OrphanPolicy};
