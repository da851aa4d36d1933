//! Transport primitives for drover: the work queue, the event bus and the
//! step log pipe.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod line_writer;
pub mod queue;

pub use config::{ConfigError, QueueConfig, QueueKind};
pub use error::{Result, TransportError};
pub use event_bus::{EventBus, SubscriptionId};
pub use line_writer::{LineWriter, Peer, RecordingPeer, TracingPeer, MASK};
pub use queue::{HttpQueue, MemoryQueue, WorkQueue};
