//! Frame-locked state synchronization for multi-node render clusters.
//!
//! One master and any number of clients exchange a per-frame state package
//! over TCP and block on a two-stage frame lock so that every node shows
//! the same frame at the same time.
//!
//! # Crate Structure
//!
//! - [`transport`] - TCP listen/dial/stream plumbing
//! - [`frame`] - 13-byte message header, compression, message reader/writer
//! - [`node`] - connections, the connection manager and the frame lock

/// Re-export transport types.
pub mod transport {
    pub use clustersync_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use clustersync_frame::*;
}

/// Re-export node types.
pub mod node {
    pub use clustersync_node::*;
}
