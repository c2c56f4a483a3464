use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::conn::{Connection, Role};
use crate::errors::Error;
use crate::packet::{Packet, MAGIC};
use crate::transport::{UdpTransport, MAX_DATAGRAM_SIZE};

/// A bound listener that demultiplexes datagrams to per-peer connections by
/// source address and runs the server half of the handshake for each.
pub struct Server {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    conns: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    token: CancellationToken,
}

/// Bind `addrs` and start accepting peers. `status_cb` supplies the blob
/// answered to unconnected pings; `login_cb` is handed every connection that
/// completes the handshake.
pub async fn listen<S, SF, L, LF>(
    addrs: impl ToSocketAddrs,
    status_cb: S,
    login_cb: L,
) -> Result<Arc<Server>, Error>
where
    S: Fn(Arc<Connection>) -> SF + Send + Sync + 'static,
    SF: Future<Output = Bytes> + Send + 'static,
    L: Fn(Arc<Connection>) -> LF + Send + Sync + 'static,
    LF: Future<Output = ()> + Send + 'static,
{
    let addr = lookup_host(addrs).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "invalid address")
    })?;
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?;
    let server = Arc::new(Server {
        socket,
        local_addr,
        conns: Mutex::new(HashMap::new()),
        token: CancellationToken::new(),
    });
    info!("[server] listening on {local_addr}");

    let accept = Arc::clone(&server);
    tokio::spawn(accept.accept_loop(Arc::new(status_cb), Arc::new(login_cb)));
    Ok(server)
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_serving(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop accepting and close every per-peer connection.
    pub fn close(&self) {
        self.token.cancel();
        for conn in self.conns.lock().values() {
            conn.close();
        }
    }

    pub async fn wait_closed(&self) {
        self.token.clone().cancelled_owned().await;
    }

    async fn accept_loop<S, SF, L, LF>(self: Arc<Self>, status_cb: Arc<S>, login_cb: Arc<L>)
    where
        S: Fn(Arc<Connection>) -> SF + Send + Sync + 'static,
        SF: Future<Output = Bytes> + Send + 'static,
        L: Fn(Arc<Connection>) -> LF + Send + Sync + 'static,
        LF: Future<Output = ()> + Send + 'static,
    {
        let (drop_tx, drop_rx) = flume::unbounded();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = tokio::select! {
                _ = self.token.cancelled() => break,
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok(recv) => recv,
                    Err(err) => {
                        debug!("[server] recv error: {err}");
                        continue;
                    }
                },
            };
            for dropped in drop_rx.try_iter() {
                self.conns.lock().remove(&dropped);
            }

            let data = Bytes::copy_from_slice(&buf[..len]);
            let existing = self.conns.lock().get(&addr).cloned();
            let conn = match existing {
                Some(conn) => conn,
                None => {
                    // strangers without the offline magic are not peers
                    if !contains_magic(&data) {
                        trace!("[server] ignored datagram without magic from {addr}");
                        continue;
                    }
                    info!("[server] new incoming from {addr}");
                    let transport = Arc::new(UdpTransport::new(
                        Arc::clone(&self.socket),
                        self.local_addr,
                        addr,
                    ));
                    let conn = Connection::new(Role::Server, transport, Some(drop_tx.clone()));
                    self.conns.lock().insert(addr, Arc::clone(&conn));
                    conn.spawn_tick_loop();
                    tokio::spawn(handle_conn(
                        Arc::clone(&conn),
                        Arc::clone(&status_cb),
                        Arc::clone(&login_cb),
                    ));
                    conn
                }
            };
            if let Err(err) = conn.on_datagram(data) {
                debug!("[server] bad datagram from {addr}: {err}");
            }
        }
        for (_, conn) in self.conns.lock().drain() {
            conn.close();
        }
    }
}

fn contains_magic(data: &[u8]) -> bool {
    data.windows(MAGIC.len()).any(|window| window == MAGIC)
}

/// Serve one peer: answer status probes, run the connection handshake, then
/// hand the online connection to the application.
async fn handle_conn<S, SF, L, LF>(conn: Arc<Connection>, status_cb: Arc<S>, login_cb: Arc<L>)
where
    S: Fn(Arc<Connection>) -> SF + Send + Sync + 'static,
    SF: Future<Output = Bytes> + Send + 'static,
    L: Fn(Arc<Connection>) -> LF + Send + Sync + 'static,
    LF: Future<Output = ()> + Send + 'static,
{
    loop {
        let packet = match conn.read().await {
            Ok(packet) => packet,
            Err(_) => return,
        };
        match packet {
            Packet::UnconnectedPing { local_time, .. }
            | Packet::UnconnectedPingOpenConnections { local_time, .. } => {
                let status = status_cb(Arc::clone(&conn)).await;
                conn.write(&Packet::UnconnectedPong {
                    guid: conn.guid(),
                    remote_time: local_time,
                    status,
                });
                conn.tick();
                conn.close();
                return;
            }
            Packet::OpenConnectionRequest1 { mtu, version } => {
                conn.set_mtu(mtu);
                conn.set_version(version);
                conn.write(&Packet::OpenConnectionReply1 {
                    guid: conn.guid(),
                    mtu: conn.mtu(),
                    security: false,
                });
            }
            Packet::OpenConnectionRequest2 { mtu, .. } => {
                conn.set_mtu(mtu);
                conn.write(&Packet::OpenConnectionReply2 {
                    guid: conn.guid(),
                    mtu: conn.mtu(),
                    remote_address: conn.peer_addr(),
                    encryption: false,
                });
                conn.tick();
                conn.set_online(true);
                break;
            }
            packet => {
                warn!(
                    "[server] unexpected {:?} from {} during handshake",
                    packet.pack_id(),
                    conn.peer_addr()
                );
                conn.close();
                return;
            }
        }
    }
    login_cb(conn).await;
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::client;
    use crate::packet::empty_address;

    const STATUS: &[u8] = b"MCPE;raklite test;100;1;0;10";

    async fn read(conn: &Arc<Connection>) -> Packet {
        timeout(Duration::from_secs(5), conn.read())
            .await
            .expect("read timed out")
            .expect("connection closed")
    }

    async fn demo_server() -> Arc<Server> {
        listen(
            "127.0.0.1:0",
            |_conn| async { Bytes::from_static(STATUS) },
            |conn| async move {
                loop {
                    let packet = match conn.read().await {
                        Ok(packet) => packet,
                        Err(_) => return,
                    };
                    match packet {
                        Packet::ConnectionRequest { local_time, .. } => {
                            conn.write(&Packet::ConnectionRequestAccepted {
                                remote_address: conn.peer_addr(),
                                system_idx: 0,
                                internal_addresses: Box::new([empty_address(); 20]),
                                remote_time: local_time,
                                local_time: 0,
                            });
                        }
                        Packet::NewIncomingConnection { .. } => {}
                        // echo everything else back
                        packet => conn.write(&packet),
                    }
                }
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_status_probe() {
        let server = demo_server().await;
        let status = timeout(Duration::from_secs(5), client::status(server.local_addr()))
            .await
            .expect("status timed out")
            .unwrap();
        assert_eq!(status, STATUS);
        server.close();
        assert!(!server.is_serving());
    }

    #[tokio::test]
    async fn test_full_login() {
        let server = demo_server().await;
        let conn = timeout(Duration::from_secs(5), client::login(server.local_addr()))
            .await
            .expect("login timed out")
            .unwrap();
        assert!(conn.is_online());
        assert_eq!(conn.mtu(), crate::conn::DEFAULT_MTU);
        conn.close();
        server.close();
    }

    #[tokio::test]
    async fn test_large_payload_roundtrip() {
        let server = demo_server().await;
        let conn = client::login(server.local_addr()).await.unwrap();

        let payload: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        let packet = Packet::Game(Bytes::from(payload));
        conn.write(&packet);
        assert_eq!(read(&conn).await, packet);

        conn.close();
        server.close();
    }

    #[tokio::test]
    async fn test_datagrams_without_magic_ignored() {
        let server = demo_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(b"not a raknet datagram", server.local_addr())
            .await
            .unwrap();
        // give the accept loop a moment, then check no peer was registered
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.conns.lock().is_empty());
        server.close();
    }

    #[tokio::test]
    async fn test_server_close_wakes_waiters() {
        let server = demo_server().await;
        let waiter = Arc::clone(&server);
        let wait = tokio::spawn(async move { waiter.wait_closed().await });
        server.close();
        timeout(Duration::from_secs(1), wait)
            .await
            .expect("wait_closed hung")
            .unwrap();
    }
}
