use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};

use crate::conn::{Connection, Role};
use crate::errors::Error;
use crate::packet::{empty_address, Packet};
use crate::transport::{UdpTransport, MAX_DATAGRAM_SIZE};

/// Open a UDP endpoint towards `addrs` and attach a protocol engine to it.
/// The connection starts offline; use [`login`] for the full handshake or
/// [`status`] for the unconnected probe.
pub async fn connect(addrs: impl ToSocketAddrs) -> Result<Arc<Connection>, Error> {
    let addr = lookup_host(addrs).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "invalid address")
    })?;
    let bind_addr = if addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    let local_addr = socket.local_addr()?;
    let transport = Arc::new(UdpTransport::new(Arc::clone(&socket), local_addr, addr));
    let conn = Connection::new(Role::Client, transport, None);
    debug!("[client] {local_addr} connecting to {addr}");

    let recv_conn = Arc::clone(&conn);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = recv_conn.wait_closed() => break,
                recv = socket.recv_from(&mut buf) => {
                    let (len, from) = match recv {
                        Ok(recv) => recv,
                        Err(err) => {
                            debug!("[client] recv error: {err}");
                            continue;
                        }
                    };
                    if from != addr {
                        continue;
                    }
                    if let Err(err) = recv_conn.on_datagram(Bytes::copy_from_slice(&buf[..len])) {
                        debug!("[client] bad datagram from {from}: {err}");
                    }
                }
            }
        }
    });
    conn.spawn_tick_loop();

    Ok(conn)
}

/// Probe a server without connecting and return its status blob.
pub async fn status(addrs: impl ToSocketAddrs) -> Result<Bytes, Error> {
    let conn = connect(addrs).await?;
    conn.write(&Packet::UnconnectedPing {
        guid: conn.guid(),
        local_time: 0,
    });
    let packet = conn.read().await;
    conn.close();
    match packet? {
        Packet::UnconnectedPong { status, .. } => Ok(status),
        packet => Err(Error::UnexpectedPacket(packet.pack_id())),
    }
}

/// Run the full four-step handshake. The connection is online on return.
pub async fn login(addrs: impl ToSocketAddrs) -> Result<Arc<Connection>, Error> {
    let conn = connect(addrs).await?;
    match drive_login(&conn).await {
        Ok(()) => {
            info!("[client] logged in to {}", conn.peer_addr());
            Ok(conn)
        }
        Err(err) => {
            conn.close();
            Err(err)
        }
    }
}

async fn drive_login(conn: &Arc<Connection>) -> Result<(), Error> {
    conn.write(&Packet::OpenConnectionRequest1 {
        mtu: conn.mtu(),
        version: conn.version(),
    });
    match conn.read().await? {
        Packet::OpenConnectionReply1 { mtu, .. } => conn.set_mtu(mtu),
        packet => return Err(Error::UnexpectedPacket(packet.pack_id())),
    }

    conn.write(&Packet::OpenConnectionRequest2 {
        guid: conn.guid(),
        mtu: conn.mtu(),
        remote_address: conn.peer_addr(),
    });
    match conn.read().await? {
        Packet::OpenConnectionReply2 { mtu, .. } => {
            conn.set_mtu(mtu);
            conn.set_online(true);
        }
        packet => return Err(Error::UnexpectedPacket(packet.pack_id())),
    }

    conn.write(&Packet::ConnectionRequest {
        guid: conn.guid(),
        local_time: 0,
        security: false,
    });
    match conn.read().await? {
        Packet::ConnectionRequestAccepted { .. } => {}
        packet => return Err(Error::UnexpectedPacket(packet.pack_id())),
    }

    conn.write(&Packet::NewIncomingConnection {
        remote_address: conn.peer_addr(),
        internal_addresses: Box::new([empty_address(); 10]),
    });
    Ok(())
}
