//! Client/server implementation of the RakNet reliable datagram protocol
//! over UDP: the offline handshake, reliable ordered delivery over frame
//! sets, fragmentation/reassembly and selective acknowledgement.
//!
//! Servers are started with [`listen`], clients with [`login`] (full
//! handshake) or [`status`] (unconnected probe). Both ends exchange
//! [`Packet`]s through [`Connection::write`] and [`Connection::read`].

mod client;
mod conn;
mod errors;
mod packet;
mod server;
mod task;
mod transport;

pub use client::{connect, login, status};
pub use conn::{Connection, DEFAULT_MTU, PROTOCOL_VERSION};
pub use errors::{CodecError, Error};
pub use packet::connected::{AckOrNack, Frame, FrameSet};
pub use packet::{empty_address, PackId, Packet, MAGIC};
pub use server::{listen, Server};
