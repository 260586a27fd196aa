//! Controller runtime errors.

use thiserror::Error;

/// Errors surfaced by the controller runtime.
///
/// `InitialSync` is the only fatal variant: it is returned from
/// `ResourceController::run` before any worker starts. Everything else is
/// pushed onto the controller's error channel while processing continues.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A notification source failed to sync its initial state
    #[error("failed to sync initial state for source {source_name}: {source}")]
    InitialSync {
        source_name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A registered handler failed for a dequeued item; the item stays
    /// rate-limited for retry
    #[error("handler failed for {key}: {source}")]
    Handler {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// A reconciliation pass triggered outside the queue (resync tick) failed
    #[error("resync failed: {0}")]
    Resync(#[source] anyhow::Error),
}
