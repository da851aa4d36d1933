//! Drover Core - data model shared by the build orchestrator crates.
//!
//! This crate defines the values that flow between the work queue, the
//! worker pool, the backend engines and the observers:
//!
//! - [`item`]: work items and the pipeline descriptors they carry
//! - [`endpoint`]: backend endpoint handles owned by the worker pool
//! - [`event`]: domain events fanned out on the event bus
//! - [`line`]: structured step output lines and uploaded log files
//! - [`state`]: step exit state, run status and the environment state machine
//! - [`error`]: error types for validation and state transitions
//!
//! # Example
//!
//! ```
//! use drover_core::item::{PipelineConfig, Stage, Step, WorkItem};
//!
//! let config = PipelineConfig::new("build-42")
//!     .stage(Stage::new("test").step(Step::new("unit", "rust:1.80")));
//! let item = WorkItem::new("42", config);
//!
//! assert!(item.validate().is_ok());
//! assert_eq!(item.config.steps().count(), 1);
//! ```

#![warn(missing_docs)]

pub mod endpoint;
pub mod error;
pub mod event;
pub mod item;
pub mod line;
pub mod state;

pub use endpoint::{Endpoint, EndpointKind, TlsPaths};
pub use error::{CoreError, Result};
pub use event::{Build, Event, Repo, Task};
pub use item::{NetworkSpec, PipelineConfig, Secret, Stage, Step, VolumeSpec, WorkItem};
pub use line::{Line, LineKind, LogFile};
pub use state::{EnvPhase, Status, StepState};
