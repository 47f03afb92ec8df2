//! TCP transport for cluster nodes.
//!
//! Wraps the blocking std sockets used by every cluster connection:
//! - [`TcpEndpoint`] binds and accepts on the server side, dials on the client side
//! - [`NodeStream`] is the connected duplex byte stream
//!
//! This is the lowest layer of clustersync. Framing, buffering and the
//! frame-lock protocol are built on top of the [`NodeStream`] type provided here.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::NodeStream;
pub use tcp::TcpEndpoint;
