//! `nodes` crate - the `ExecutableNode` trait, the node-type catalog, and
//! built-in node implementations.
//!
//! Every node, built-in or caller-registered, must implement
//! [`ExecutableNode`]. The engine looks actions up by type name in a
//! [`NodeCatalog`] and never branches on type strings itself.

pub mod error;
pub mod traits;
pub mod catalog;
pub mod builtin;
pub mod mock;

pub use error::NodeError;
pub use traits::{ExecutableNode, ExecutionContext};
pub use catalog::NodeCatalog;
