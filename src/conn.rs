use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::errors::Error;
use crate::packet::connected::{AckOrNack, Frame, FrameSet, Fragment};
use crate::packet::{Packet, FRAME_SET_HEADER_SIZE};
use crate::task::Task;
use crate::transport::Transport;

/// MTU assumed until the handshake negotiates one.
pub const DEFAULT_MTU: u16 = 1446;

/// Offline protocol version spoken during the handshake.
pub const PROTOCOL_VERSION: u8 = 10;

/// Cadence of the background flush loop.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(50);

// 20 ticks between retransmissions gives a 1s interval at the 50ms cadence.
const RETRANSMIT_TICKS: i32 = 20;
const RETRANSMIT_RETRIES: i32 = 5;

// reserved for the IP + UDP headers when sizing a frame set
const UDP_OVERHEAD: usize = 28;
// headroom for the frame set prefix and the largest frame header
const FRAME_OVERHEAD: usize = 60;

const FRAGMENT_CHANNELS: u16 = 32;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug)]
struct State {
    mtu: u16,
    version: u8,
    online: bool,

    read_frame_set_idx: u32,
    read_missing: HashSet<u32>,
    read_order_idx: u32,
    read_order_chan: HashMap<u32, Frame>,
    read_fragment_chans: HashMap<u16, HashMap<u32, Frame>>,

    write_reliable_idx: u32,
    write_order_idx: u32,
    write_frame_set_idx: u32,
    write_fragment_chan: u16,
    write_frame_set_chan: HashMap<u32, Vec<u32>>,
    write_online_tasks: Vec<Task<Frame>>,
    write_offline_task: Option<Task<Bytes>>,
}

impl State {
    fn new() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            version: PROTOCOL_VERSION,
            online: false,
            read_frame_set_idx: 0,
            read_missing: HashSet::new(),
            read_order_idx: 0,
            read_order_chan: HashMap::new(),
            read_fragment_chans: HashMap::new(),
            write_reliable_idx: 0,
            write_order_idx: 0,
            write_frame_set_idx: 0,
            write_fragment_chan: 0,
            write_frame_set_chan: HashMap::new(),
            write_online_tasks: Vec::new(),
            write_offline_task: None,
        }
    }
}

/// A per-peer protocol engine. Ingress datagrams are fed through
/// [`Connection::on_datagram`] by the owning receive loop; egress is queued
/// with [`Connection::write`] and flushed by the periodic tick.
pub struct Connection {
    role: Role,
    guid: u64,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
    drop_tx: Option<flume::Sender<SocketAddr>>,
    state: Mutex<State>,
    read_tx: async_channel::Sender<Packet>,
    read_rx: async_channel::Receiver<Packet>,
}

impl Connection {
    pub(crate) fn new(
        role: Role,
        transport: Arc<dyn Transport>,
        drop_tx: Option<flume::Sender<SocketAddr>>,
    ) -> Arc<Self> {
        let (read_tx, read_rx) = async_channel::unbounded();
        Arc::new(Self {
            role,
            guid: rand::random(),
            transport,
            token: CancellationToken::new(),
            drop_tx,
            state: Mutex::new(State::new()),
            read_tx,
            read_rx,
        })
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn mtu(&self) -> u16 {
        self.state.lock().mtu
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        self.state.lock().mtu = mtu;
    }

    pub fn version(&self) -> u8 {
        self.state.lock().version
    }

    pub(crate) fn set_version(&self, version: u8) {
        self.state.lock().version = version;
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.transport.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the background loops, unblock pending reads and tell the owner
    /// to forget this peer. Idempotent.
    pub fn close(&self) {
        if self.token.is_cancelled() {
            return;
        }
        debug!("[{}] closing connection to {}", self.role, self.peer_addr());
        self.token.cancel();
        self.read_tx.close();
        if let Some(drop_tx) = &self.drop_tx {
            let _ = drop_tx.send(self.peer_addr());
        }
    }

    pub async fn wait_closed(&self) {
        self.token.clone().cancelled_owned().await;
    }

    /// Next application-level packet, in order-channel order.
    pub async fn read(&self) -> Result<Packet, Error> {
        self.read_rx
            .recv()
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Queue a packet for delivery. Offline it replaces the single pending
    /// handshake datagram; online it is framed, fragmented if oversized and
    /// scheduled for the next tick.
    pub fn write(&self, packet: &Packet) {
        let state = &mut *self.state.lock();
        self.write_locked(state, packet);
    }

    fn write_locked(&self, state: &mut State, packet: &Packet) {
        let mut data = packet.encode();

        if !state.online {
            state.write_offline_task =
                Some(Task::new(data, RETRANSMIT_TICKS, RETRANSMIT_RETRIES));
            return;
        }

        let mtu_frame = (state.mtu as usize).saturating_sub(FRAME_OVERHEAD).max(1);
        let mut frames = Vec::new();

        if data.len() <= mtu_frame {
            // pings and pongs ride unreliable and unordered
            if matches!(data[0], 0x00 | 0x03) {
                frames.push(Frame::unreliable(data));
            } else {
                frames.push(Frame {
                    payload: data,
                    reliable_idx: Some(state.write_reliable_idx),
                    order_idx: Some(state.write_order_idx),
                    fragment: None,
                });
                state.write_reliable_idx += 1;
                state.write_order_idx += 1;
            }
        } else {
            let count = data.len().div_ceil(mtu_frame) as u32;
            for idx in 0..count {
                let chunk = data.split_to(data.len().min(mtu_frame));
                frames.push(Frame {
                    payload: chunk,
                    reliable_idx: Some(state.write_reliable_idx),
                    order_idx: Some(state.write_order_idx),
                    fragment: Some(Fragment {
                        count,
                        chan: state.write_fragment_chan,
                        idx,
                    }),
                });
                state.write_reliable_idx += 1;
            }
            state.write_fragment_chan = (state.write_fragment_chan + 1) % FRAGMENT_CHANNELS;
            state.write_order_idx += 1;
        }

        for frame in frames {
            let retries = if frame.reliable() {
                RETRANSMIT_RETRIES
            } else {
                0
            };
            state
                .write_online_tasks
                .push(Task::new(frame, RETRANSMIT_TICKS, retries));
        }
    }

    /// Parse one inbound datagram and take the branches its type calls for.
    /// Payloads released by reassembly and reordering are complete packets
    /// again; they run through the same dispatch via a work queue.
    pub(crate) fn on_datagram(&self, data: Bytes) -> Result<(), Error> {
        let mut pending = VecDeque::new();
        pending.push_back(data);
        let state = &mut *self.state.lock();
        while let Some(mut data) = pending.pop_front() {
            let packet = Packet::decode(&mut data)?;
            self.dispatch(state, packet, &mut pending)?;
        }
        Ok(())
    }

    fn dispatch(
        &self,
        state: &mut State,
        packet: Packet,
        pending: &mut VecDeque<Bytes>,
    ) -> Result<(), Error> {
        match packet {
            Packet::ConnectedPing { local_time } => {
                self.write_locked(
                    state,
                    &Packet::ConnectedPong {
                        remote_time: local_time,
                        local_time: 0,
                    },
                );
            }
            Packet::Ack(records) => self.on_ack(state, &records, true),
            Packet::Nack(records) => self.on_ack(state, &records, false),
            Packet::FrameSet(set) => self.on_frame_set(state, set, pending)?,
            packet => {
                if self.read_tx.try_send(packet).is_err() {
                    trace!("[{}] read queue closed, packet dropped", self.role);
                }
            }
        }
        Ok(())
    }

    /// Release the frame set entries an ACK or NACK names, then stop
    /// (acknowledged) or rearm (lost) every task that carried one of the
    /// covered reliable frames.
    fn on_ack(&self, state: &mut State, records: &AckOrNack, acknowledged: bool) {
        let mut reliable_indices = Vec::new();
        for idx in records.indices() {
            if let Some(mut indices) = state.write_frame_set_chan.remove(&idx) {
                reliable_indices.append(&mut indices);
            }
        }
        if reliable_indices.is_empty() {
            return;
        }
        trace!(
            "[{}] {} names {} frame sets covering {} reliable frames",
            self.role,
            if acknowledged { "ack" } else { "nack" },
            records.total_cnt(),
            reliable_indices.len()
        );
        for task in &mut state.write_online_tasks {
            let Some(idx) = task.obj().reliable_idx else {
                continue;
            };
            if !reliable_indices.contains(&idx) {
                continue;
            }
            if acknowledged {
                task.stop();
            } else {
                task.reset();
            }
        }
    }

    fn on_frame_set(
        &self,
        state: &mut State,
        set: FrameSet,
        pending: &mut VecDeque<Bytes>,
    ) -> Result<(), Error> {
        // An index below the read cursor is either a late gap filler (still
        // marked missing) or a duplicate delivery, which is only re-acked.
        if set.idx < state.read_frame_set_idx && !state.read_missing.remove(&set.idx) {
            trace!(
                "[{}] duplicate frame set {} from {}",
                self.role,
                set.idx,
                self.peer_addr()
            );
            self.send_ack(std::iter::once(set.idx), true);
            return Ok(());
        }

        for frame in set.frames {
            let frame = if let Some(fragment) = frame.fragment {
                let chan = state.read_fragment_chans.entry(fragment.chan).or_default();
                chan.insert(fragment.idx, frame);
                if chan.len() as u32 != fragment.count {
                    continue;
                }
                let mut parts = state
                    .read_fragment_chans
                    .remove(&fragment.chan)
                    .unwrap_or_default();
                let mut fragments = Vec::with_capacity(fragment.count as usize);
                for idx in 0..fragment.count {
                    fragments.push(parts.remove(&idx).ok_or(Error::MissingFragment(idx))?);
                }
                trace!(
                    "[{}] reassembled {} fragments on channel {}",
                    self.role,
                    fragment.count,
                    fragment.chan
                );
                Frame::from_fragments(fragments)
            } else {
                frame
            };

            if let Some(order_idx) = frame.order_idx {
                if order_idx >= state.read_order_idx {
                    state.read_order_chan.insert(order_idx, frame);
                }
                while let Some(next) = state.read_order_chan.remove(&state.read_order_idx) {
                    pending.push_back(next.payload);
                    state.read_order_idx += 1;
                }
            } else {
                pending.push_back(frame.payload);
            }
        }

        if state.read_frame_set_idx < set.idx {
            for idx in state.read_frame_set_idx..set.idx {
                state.read_missing.insert(idx);
            }
            self.send_ack(state.read_frame_set_idx..set.idx, false);
        }
        self.send_ack(std::iter::once(set.idx), true);
        state.read_frame_set_idx = state.read_frame_set_idx.max(set.idx + 1);
        Ok(())
    }

    /// ACKs and NACKs bypass the egress queue and go straight out.
    fn send_ack(&self, indices: impl Iterator<Item = u32>, acknowledged: bool) {
        if let Some(records) = AckOrNack::from_sorted(indices) {
            let packet = if acknowledged {
                Packet::Ack(records)
            } else {
                Packet::Nack(records)
            };
            self.transport.send(&packet.encode());
        }
    }

    /// Flush everything that is due: offline, the single handshake datagram;
    /// online, all active frames bin-packed into MTU-bounded frame sets.
    pub(crate) fn tick(&self) {
        let state = &mut *self.state.lock();

        if !state.online {
            let Some(task) = state.write_offline_task.as_mut() else {
                return;
            };
            if !task.alive() {
                return;
            }
            if task.active() {
                trace!(
                    "[{}] send offline datagram to {}, {} bytes",
                    self.role,
                    self.transport.peer_addr(),
                    task.obj().len()
                );
                self.transport.send(task.obj());
            }
            task.tick();
            return;
        }

        let mut frames = VecDeque::new();
        state.write_online_tasks.retain_mut(|task| {
            if !task.alive() {
                return false;
            }
            if task.active() {
                frames.push_back(task.obj().clone());
            }
            task.tick();
            true
        });

        let cap = (state.mtu as usize).saturating_sub(UDP_OVERHEAD);
        while !frames.is_empty() {
            let mut set = FrameSet {
                idx: state.write_frame_set_idx,
                frames: Vec::new(),
            };
            let mut size = FRAME_SET_HEADER_SIZE;
            let mut reliable_indices = Vec::new();
            while let Some(frame) = frames.front() {
                if size + frame.size() > cap {
                    break;
                }
                let frame = frames.pop_front().expect("peeked frame");
                size += frame.size();
                if let Some(idx) = frame.reliable_idx {
                    reliable_indices.push(idx);
                }
                set.frames.push(frame);
            }
            debug_assert!(
                !set.frames.is_empty(),
                "every frame size should stay below the frame set budget"
            );
            if set.frames.is_empty() {
                break;
            }
            trace!(
                "[{}] send frame set {} to {}, frames: {}, size: {}",
                self.role,
                set.idx,
                self.transport.peer_addr(),
                set.frames.len(),
                size
            );
            state
                .write_frame_set_chan
                .insert(state.write_frame_set_idx, reliable_indices);
            state.write_frame_set_idx += 1;
            self.transport.send(&Packet::FrameSet(set).encode());
        }
    }

    /// Run `tick` every 50ms until the connection closes.
    pub(crate) fn spawn_tick_loop(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = conn.wait_closed() => break,
                    _ = ticker.tick() => conn.tick(),
                }
            }
        });
    }
}
