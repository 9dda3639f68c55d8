//! Execution engine for workflows.
//!
//! [`Executor`] walks one run's graph; [`NodeRunner`] runs a single node
//! with expression resolution and retries; [`Engine`] ties storage, the
//! queue, and cancellation together for trigger sources and workers.

mod cancel;
mod executor;
mod monitor;
mod node_runner;
mod runtime;

pub use cancel::CancellationRegistry;
pub use executor::Executor;
pub use monitor::{Monitor, MonitorEvent};
pub use node_runner::{error_detail, NodeFailure, NodeOutcome, NodeRunner};
pub use runtime::{Engine, EngineBuilder};
