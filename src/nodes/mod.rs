//! Node implementations.
//!
//! Nodes are the building blocks of workflows. Each node type performs
//! a specific action (start a run, reshape items, call an external
//! service) and declares its ports and parameters through [`NodeMetadata`].

mod database;
mod email;
mod http;
mod if_node;
mod merge;
mod registry;
mod s3;
mod set;
mod trigger;
mod types;

pub use database::DatabaseNode;
pub use email::EmailNode;
pub use http::{HttpNode, ALLOW_INTERNAL_URLS_ENV};
pub use if_node::IfNode;
pub use merge::MergeNode;
pub use registry::NodeRegistry;
pub use s3::S3Node;
pub use set::SetNode;
pub use trigger::{ManualTriggerNode, ScheduleTriggerNode, WebhookTriggerNode};
pub use types::{Node, NodeContext, NodeMetadata, NodeResult, ParameterSpec, MAIN_PORT};
