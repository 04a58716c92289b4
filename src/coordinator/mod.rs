//! Coordination layer
//!
//! The coordinator is responsible for:
//! - Counter ownership allocation via a small consensus group
//! - Fencing stale owners across failovers
//! - Routing requests to the committed owner (redirect hints on miss)
//! - Identifier generation and epoch allocation on top of the store

pub mod grpc;
pub mod http;
pub mod meta;
pub mod ownership;
pub mod peer_client;
pub mod raft_node;
pub mod server;
pub mod service;

pub use server::Coordinator;
pub use service::CoordService;
