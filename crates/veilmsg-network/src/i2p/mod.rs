//! I2P integration
//!
//! - `sam_client`: SAM v3 protocol client over the local bridge
//! - `sam_reply`: reply line grammar
//! - `daemon`: state machine around the i2p daemon
//! - `bridge`: the call surface the daemon is driven through
//! - `identity`: b32 addresses and identity descriptors

pub mod bridge;
pub mod daemon;
pub mod identity;
pub mod sam_client;
pub mod sam_reply;
