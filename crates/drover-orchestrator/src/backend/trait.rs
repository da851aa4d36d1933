//! Backend engine contract.
//!
//! An engine runs the steps of one pipeline on one compute backend. The
//! dispatcher drives it through a fixed sequence per run:
//!
//! 1. `setup` provisions the shared environment (network, volumes,
//!    namespace)
//! 2. per step: `exec` starts it, `tail` and `wait` run concurrently
//! 3. `destroy` tears everything down, even after a partial `setup`

use async_trait::async_trait;
use bytes::Bytes;
use drover_core::{Endpoint, PipelineConfig, Step, StepState, WorkItem};
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::Result;

/// Live, ordered output of one step.
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// Compute backend able to run pipeline steps.
///
/// Implementations must be `Send + Sync`: steps of one stage are driven
/// concurrently against the same engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Returns the backend name.
    fn name(&self) -> &str;

    /// Provisions the pipeline environment. Safe to retry.
    async fn setup(&self, config: &PipelineConfig) -> Result<()>;

    /// Starts a step. Returns once the backend accepted the start, not when
    /// the step finishes.
    async fn exec(&self, step: &Step) -> Result<()>;

    /// Forcibly stops a running step.
    ///
    /// Deprecated: `destroy` already stops every step. Kept for step
    /// timeouts.
    async fn kill(&self, step: &Step) -> Result<()>;

    /// Blocks until the step reaches a terminal state.
    async fn wait(&self, step: &Step) -> Result<StepState>;

    /// Streams the step's combined output. Dropping the stream does not
    /// affect `wait`.
    async fn tail(&self, step: &Step) -> Result<LogStream>;

    /// Tears down the pipeline environment, best-effort.
    async fn destroy(&self, config: &PipelineConfig) -> Result<()>;
}

/// A shared engine for dynamic dispatch.
pub type BoxedEngine = Arc<dyn Engine>;

/// Opens engines on endpoints.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Opens an engine on `endpoint` to run `item`.
    async fn connect(&self, endpoint: &Endpoint, item: &WorkItem) -> Result<BoxedEngine>;

    /// Checks that the endpoint is reachable.
    async fn ping(&self, endpoint: &Endpoint) -> Result<()>;
}
