//! Synchronization engine: reconciles optimistic local edits with remote
//! change events, tracks collaborator presence, and drives both from one
//! event loop per session.

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod presence;
pub mod reconciler;
pub mod session;

pub use presence::PresenceTracker;
pub use reconciler::{ConnectionState, Reconciler};
pub use session::{
    spawn_session, ActionOutcome, Collaborators, LocalAction, SessionConfig, SessionError,
    SessionHandle,
};
