//! Controller runtime for the gateway control plane
//!
//! A rate-limited, key-deduplicating work queue ([`EventQueue`]) and the
//! [`ResourceController`] that binds change-notification sources to it and
//! dispatches queued items to registered handlers on a configurable number
//! of workers. Handler failures re-queue the item under backoff and are
//! reported on an error channel; they never kill a worker.

pub mod backoff;
pub mod controller;
pub mod error;
pub mod queue;
pub mod source;

pub use backoff::FibonacciBackoff;
pub use controller::{EventHandler, ResourceController};
pub use error::ControllerError;
pub use queue::{Event, EventQueue, WorkItem};
pub use source::{KubeSource, NotificationSource};
