//! Veilmsg i2p transport
//!
//! Everything needed to reach a peer over i2p:
//! - SAM v3 control client (sessions, stream connect/accept, datagrams)
//! - Lifecycle management for the local i2p daemon behind a narrow
//!   C-style boundary
//! - b32 addresses and the shareable identity descriptor

pub mod i2p;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use i2p::bridge::{DaemonBridge, I2pdProcessBridge, START_OK};
pub use i2p::daemon::{DaemonConfig, DaemonError, DaemonEvent, DaemonManager, DaemonState};
pub use i2p::identity::{
    b32_address, generate_qr_content, is_valid_b32, parse_qr_content, Identity,
    IdentityDescriptor, IdentityError,
};
pub use i2p::sam_client::{
    GeneratedDestination, SamClient, SamConfig, SamError, SamSession, SessionStyle,
};
