//! Common utilities and types shared across scarab

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, CoordinatorConfig, FlushPolicy, PeerConfig};
pub use error::{Error, Result};
pub use utils::{
    decode_counter_id, encode_counter_id, timestamp_now, timestamp_now_millis,
    validate_counter_id, NodeState,
};
