//! flowrun - workflow execution engine
//!
//! A workflow is a graph of typed nodes joined by port-to-port
//! connections. flowrun validates the graph, walks it from a trigger node
//! in readiness order, resolves `{{ }}` expressions in node parameters
//! against upstream data, and wraps each node's external call in
//! classification-driven retries and per-service circuit breakers.
//!
//! ## Example
//!
//! ```yaml
//! name: order-sync
//! nodes:
//!   - id: hook
//!     type: webhook
//!   - id: shape
//!     type: set
//!     parameters:
//!       keep_only_set: true
//!       values:
//!         order_id: "{{ $json.id }}"
//!   - id: forward
//!     type: http
//!     parameters:
//!       url: https://api.example.com/orders
//!       method: POST
//!       body: "{{ $json }}"
//! connections:
//!   - { from: hook, to: shape }
//!   - { from: shape, to: forward }
//! ```
//!
//! Runs are triggered through [`engine::Engine::trigger`] and executed by
//! [`queue::Worker`]s draining a [`queue::JobQueue`].

pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod expression;
pub mod metrics;
pub mod nodes;
pub mod queue;
pub mod resilience;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod workflow;

pub use error::{Error, Result};
