//! Drover Orchestrator - runs pipeline work on a pool of compute backends.
//!
//! This crate provides:
//! - [`lock`]: keyed, process-local mutual exclusion with timeouts
//! - [`cluster`]: the worker pool handing out endpoints one run at a time
//! - [`backend`]: the engine contract with docker and kubernetes backends
//! - [`dispatch`]: the dispatcher tying queue, pool and backends together
//!
//! # Example
//!
//! ```rust,ignore
//! use drover_orchestrator::{Cluster, DispatchConfig, Dispatcher};
//!
//! let cluster = Cluster::new();
//! register_endpoints(&factory, &cluster, endpoints).await;
//! let dispatcher = Dispatcher::new(queue, cluster, factory, bus, peer, locks, DispatchConfig::default());
//! dispatcher.run(cancel).await;
//! ```

pub mod backend;
pub mod cluster;
pub mod dispatch;
pub mod error;
pub mod lock;

pub use backend::{
    Ambassador, AmbassadorConfig, BackendFactory, BollardClient, BoxedEngine, ContainerClient, ContainerSpec,
    DockerEngine, DockerFactory, Engine, EngineFactory, KubeEngine, KubeFactory, LogStream,
};
pub use cluster::{Cluster, Reservation, DEFAULT_POOL_CAPACITY};
pub use dispatch::{register_endpoints, DispatchConfig, Dispatcher};
pub use error::{OrchestratorError, Result};
pub use lock::{acquire_all, Lock, LockManager};
