pub(crate) mod connected;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::CodecError;
use crate::packet::connected::{AckOrNack, FrameSet};

/// Fixed 16 bytes marking every offline (pre-handshake) datagram.
pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// Bytes taken by the frame set prefix (ident + u24 sequence index).
pub(crate) const FRAME_SET_HEADER_SIZE: usize = 4;

// OpenConnectionRequest1 pads with zeroes so that the IP packet matches the
// advertised MTU; ident + magic + version + IP/UDP headers account for 46.
const REQUEST1_OVERHEAD: usize = 46;

/// Packet ids. Frame sets occupy the whole 0x80..=0x8f range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PackId {
    ConnectedPing = 0x00,
    UnconnectedPing = 0x01,
    UnconnectedPingOpenConnections = 0x02,
    ConnectedPong = 0x03,
    OpenConnectionRequest1 = 0x05,
    OpenConnectionReply1 = 0x06,
    OpenConnectionRequest2 = 0x07,
    OpenConnectionReply2 = 0x08,
    ConnectionRequest = 0x09,
    ConnectionRequestAccepted = 0x10,
    NewIncomingConnection = 0x13,
    DisconnectionNotification = 0x15,
    IncompatibleProtocolVersion = 0x19,
    UnconnectedPong = 0x1c,
    FrameSet = 0x80,
    Nack = 0xa0,
    Ack = 0xc0,
    Game = 0xfe,
}

impl PackId {
    pub fn from_u8(ident: u8) -> Result<Self, CodecError> {
        match ident {
            0x00 => Ok(PackId::ConnectedPing),
            0x01 => Ok(PackId::UnconnectedPing),
            0x02 => Ok(PackId::UnconnectedPingOpenConnections),
            0x03 => Ok(PackId::ConnectedPong),
            0x05 => Ok(PackId::OpenConnectionRequest1),
            0x06 => Ok(PackId::OpenConnectionReply1),
            0x07 => Ok(PackId::OpenConnectionRequest2),
            0x08 => Ok(PackId::OpenConnectionReply2),
            0x09 => Ok(PackId::ConnectionRequest),
            0x10 => Ok(PackId::ConnectionRequestAccepted),
            0x13 => Ok(PackId::NewIncomingConnection),
            0x15 => Ok(PackId::DisconnectionNotification),
            0x19 => Ok(PackId::IncompatibleProtocolVersion),
            0x1c => Ok(PackId::UnconnectedPong),
            0x80..=0x8f => Ok(PackId::FrameSet),
            0xa0 => Ok(PackId::Nack),
            0xc0 => Ok(PackId::Ack),
            0xfe => Ok(PackId::Game),
            _ => Err(CodecError::UnknownPackId(ident)),
        }
    }
}

pub(crate) fn ensure(buf: &impl Buf, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Underrun);
    }
    Ok(())
}

pub(crate) fn read_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_bool(buf: &mut Bytes) -> Result<bool, CodecError> {
    Ok(read_u8(buf)? != 0)
}

pub(crate) fn read_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub(crate) fn read_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn read_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub(crate) fn read_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, CodecError> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn read_magic(buf: &mut Bytes) -> Result<(), CodecError> {
    if read_bytes(buf, MAGIC.len())? != MAGIC.as_slice() {
        return Err(CodecError::BadMagic);
    }
    Ok(())
}

/// The address used to pad fixed-length internal-address arrays.
pub fn empty_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 0))
}

pub(crate) fn read_address(buf: &mut Bytes) -> Result<SocketAddr, CodecError> {
    match read_u8(buf)? {
        4 => {
            ensure(buf, 4)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = read_u16(buf)?;
            Ok(SocketAddr::V4(SocketAddrV4::new(octets.into(), port)))
        }
        6 => {
            // two bytes of sockaddr family written by the reference stacks
            read_u16(buf)?;
            let port = read_u16(buf)?;
            let flowinfo = read_u32(buf)?;
            ensure(buf, 16)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let scope_id = read_u32(buf)?;
            Ok(SocketAddr::V6(SocketAddrV6::new(
                octets.into(),
                port,
                flowinfo,
                scope_id,
            )))
        }
        version => Err(CodecError::InvalidAddressFamily(version)),
    }
}

pub(crate) fn write_address(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&[0x17, 0x00]);
            buf.put_u16(v6.port());
            buf.put_u32(v6.flowinfo());
            buf.put_slice(&v6.ip().octets());
            buf.put_u32(v6.scope_id());
        }
    }
}

fn read_address_array<const N: usize>(buf: &mut Bytes) -> Result<Box<[SocketAddr; N]>, CodecError> {
    let mut addresses = Box::new([empty_address(); N]);
    for slot in addresses.iter_mut() {
        *slot = read_address(buf)?;
    }
    Ok(addresses)
}

/// Every packet the protocol speaks, dispatched by the leading type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectedPing {
        local_time: u64,
    },
    UnconnectedPing {
        guid: u64,
        local_time: u64,
    },
    UnconnectedPingOpenConnections {
        guid: u64,
        local_time: u64,
    },
    ConnectedPong {
        remote_time: u64,
        local_time: u64,
    },
    OpenConnectionRequest1 {
        mtu: u16,
        version: u8,
    },
    OpenConnectionReply1 {
        guid: u64,
        mtu: u16,
        security: bool,
    },
    OpenConnectionRequest2 {
        guid: u64,
        mtu: u16,
        remote_address: SocketAddr,
    },
    OpenConnectionReply2 {
        guid: u64,
        mtu: u16,
        remote_address: SocketAddr,
        encryption: bool,
    },
    ConnectionRequest {
        guid: u64,
        local_time: u64,
        security: bool,
    },
    ConnectionRequestAccepted {
        remote_address: SocketAddr,
        system_idx: u16,
        internal_addresses: Box<[SocketAddr; 20]>,
        remote_time: u64,
        local_time: u64,
    },
    NewIncomingConnection {
        remote_address: SocketAddr,
        internal_addresses: Box<[SocketAddr; 10]>,
    },
    DisconnectionNotification,
    IncompatibleProtocolVersion {
        version: u8,
        guid: u64,
    },
    UnconnectedPong {
        guid: u64,
        remote_time: u64,
        status: Bytes,
    },
    Game(Bytes),
    Ack(AckOrNack),
    Nack(AckOrNack),
    FrameSet(FrameSet),
}

impl Packet {
    pub fn pack_id(&self) -> PackId {
        match self {
            Packet::ConnectedPing { .. } => PackId::ConnectedPing,
            Packet::UnconnectedPing { .. } => PackId::UnconnectedPing,
            Packet::UnconnectedPingOpenConnections { .. } => {
                PackId::UnconnectedPingOpenConnections
            }
            Packet::ConnectedPong { .. } => PackId::ConnectedPong,
            Packet::OpenConnectionRequest1 { .. } => PackId::OpenConnectionRequest1,
            Packet::OpenConnectionReply1 { .. } => PackId::OpenConnectionReply1,
            Packet::OpenConnectionRequest2 { .. } => PackId::OpenConnectionRequest2,
            Packet::OpenConnectionReply2 { .. } => PackId::OpenConnectionReply2,
            Packet::ConnectionRequest { .. } => PackId::ConnectionRequest,
            Packet::ConnectionRequestAccepted { .. } => PackId::ConnectionRequestAccepted,
            Packet::NewIncomingConnection { .. } => PackId::NewIncomingConnection,
            Packet::DisconnectionNotification => PackId::DisconnectionNotification,
            Packet::IncompatibleProtocolVersion { .. } => PackId::IncompatibleProtocolVersion,
            Packet::UnconnectedPong { .. } => PackId::UnconnectedPong,
            Packet::Game(_) => PackId::Game,
            Packet::Ack(_) => PackId::Ack,
            Packet::Nack(_) => PackId::Nack,
            Packet::FrameSet(_) => PackId::FrameSet,
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let ident = *buf.first().ok_or(CodecError::Underrun)?;
        if ident & 0xf0 == 0x80 {
            return Ok(Packet::FrameSet(FrameSet::read(buf)?));
        }
        buf.advance(1);
        match PackId::from_u8(ident)? {
            PackId::ConnectedPing => Ok(Packet::ConnectedPing {
                local_time: read_u64(buf)?,
            }),
            PackId::UnconnectedPing => {
                let local_time = read_u64(buf)?;
                read_magic(buf)?;
                let guid = read_u64(buf)?;
                Ok(Packet::UnconnectedPing { guid, local_time })
            }
            PackId::UnconnectedPingOpenConnections => {
                let local_time = read_u64(buf)?;
                read_magic(buf)?;
                let guid = read_u64(buf)?;
                Ok(Packet::UnconnectedPingOpenConnections { guid, local_time })
            }
            PackId::ConnectedPong => Ok(Packet::ConnectedPong {
                remote_time: read_u64(buf)?,
                local_time: read_u64(buf)?,
            }),
            PackId::OpenConnectionRequest1 => {
                read_magic(buf)?;
                let version = read_u8(buf)?;
                let mtu = u16::try_from(buf.remaining() + REQUEST1_OVERHEAD).unwrap_or(u16::MAX);
                buf.advance(buf.remaining());
                Ok(Packet::OpenConnectionRequest1 { mtu, version })
            }
            PackId::OpenConnectionReply1 => {
                read_magic(buf)?;
                let guid = read_u64(buf)?;
                let security = read_bool(buf)?;
                let mtu = read_u16(buf)?;
                Ok(Packet::OpenConnectionReply1 {
                    guid,
                    mtu,
                    security,
                })
            }
            PackId::OpenConnectionRequest2 => {
                read_magic(buf)?;
                let remote_address = read_address(buf)?;
                let mtu = read_u16(buf)?;
                let guid = read_u64(buf)?;
                Ok(Packet::OpenConnectionRequest2 {
                    guid,
                    mtu,
                    remote_address,
                })
            }
            PackId::OpenConnectionReply2 => {
                read_magic(buf)?;
                let guid = read_u64(buf)?;
                let remote_address = read_address(buf)?;
                let mtu = read_u16(buf)?;
                let encryption = read_bool(buf)?;
                Ok(Packet::OpenConnectionReply2 {
                    guid,
                    mtu,
                    remote_address,
                    encryption,
                })
            }
            PackId::ConnectionRequest => Ok(Packet::ConnectionRequest {
                guid: read_u64(buf)?,
                local_time: read_u64(buf)?,
                security: read_bool(buf)?,
            }),
            PackId::ConnectionRequestAccepted => {
                let remote_address = read_address(buf)?;
                let system_idx = read_u16(buf)?;
                let internal_addresses = read_address_array::<20>(buf)?;
                let remote_time = read_u64(buf)?;
                let local_time = read_u64(buf)?;
                Ok(Packet::ConnectionRequestAccepted {
                    remote_address,
                    system_idx,
                    internal_addresses,
                    remote_time,
                    local_time,
                })
            }
            PackId::NewIncomingConnection => Ok(Packet::NewIncomingConnection {
                remote_address: read_address(buf)?,
                internal_addresses: read_address_array::<10>(buf)?,
            }),
            PackId::DisconnectionNotification => Ok(Packet::DisconnectionNotification),
            PackId::IncompatibleProtocolVersion => {
                let version = read_u8(buf)?;
                read_magic(buf)?;
                let guid = read_u64(buf)?;
                Ok(Packet::IncompatibleProtocolVersion { version, guid })
            }
            PackId::UnconnectedPong => {
                let remote_time = read_u64(buf)?;
                let guid = read_u64(buf)?;
                read_magic(buf)?;
                let length = read_u16(buf)? as usize;
                let status = read_bytes(buf, length)?;
                Ok(Packet::UnconnectedPong {
                    guid,
                    remote_time,
                    status,
                })
            }
            PackId::Game => Ok(Packet::Game(buf.split_to(buf.remaining()))),
            PackId::Nack => Ok(Packet::Nack(AckOrNack::read(buf)?)),
            PackId::Ack => Ok(Packet::Ack(AckOrNack::read(buf)?)),
            PackId::FrameSet => Err(CodecError::UnknownPackId(ident)),
        }
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) {
        match self {
            Packet::FrameSet(set) => {
                set.write(buf);
                return;
            }
            Packet::Ack(records) => {
                buf.put_u8(PackId::Ack as u8);
                records.write(buf);
                return;
            }
            Packet::Nack(records) => {
                buf.put_u8(PackId::Nack as u8);
                records.write(buf);
                return;
            }
            _ => {}
        }
        buf.put_u8(self.pack_id() as u8);
        match self {
            Packet::ConnectedPing { local_time } => {
                buf.put_u64(*local_time);
            }
            Packet::UnconnectedPing { guid, local_time }
            | Packet::UnconnectedPingOpenConnections { guid, local_time } => {
                buf.put_u64(*local_time);
                buf.put_slice(&MAGIC);
                buf.put_u64(*guid);
            }
            Packet::ConnectedPong {
                remote_time,
                local_time,
            } => {
                buf.put_u64(*remote_time);
                buf.put_u64(*local_time);
            }
            Packet::OpenConnectionRequest1 { mtu, version } => {
                buf.put_slice(&MAGIC);
                buf.put_u8(*version);
                buf.put_bytes(0, (*mtu as usize).saturating_sub(REQUEST1_OVERHEAD));
            }
            Packet::OpenConnectionReply1 {
                guid,
                mtu,
                security,
            } => {
                buf.put_slice(&MAGIC);
                buf.put_u64(*guid);
                buf.put_u8(*security as u8);
                buf.put_u16(*mtu);
            }
            Packet::OpenConnectionRequest2 {
                guid,
                mtu,
                remote_address,
            } => {
                buf.put_slice(&MAGIC);
                write_address(buf, remote_address);
                buf.put_u16(*mtu);
                buf.put_u64(*guid);
            }
            Packet::OpenConnectionReply2 {
                guid,
                mtu,
                remote_address,
                encryption,
            } => {
                buf.put_slice(&MAGIC);
                buf.put_u64(*guid);
                write_address(buf, remote_address);
                buf.put_u16(*mtu);
                buf.put_u8(*encryption as u8);
            }
            Packet::ConnectionRequest {
                guid,
                local_time,
                security,
            } => {
                buf.put_u64(*guid);
                buf.put_u64(*local_time);
                buf.put_u8(*security as u8);
            }
            Packet::ConnectionRequestAccepted {
                remote_address,
                system_idx,
                internal_addresses,
                remote_time,
                local_time,
            } => {
                write_address(buf, remote_address);
                buf.put_u16(*system_idx);
                for address in internal_addresses.iter() {
                    write_address(buf, address);
                }
                buf.put_u64(*remote_time);
                buf.put_u64(*local_time);
            }
            Packet::NewIncomingConnection {
                remote_address,
                internal_addresses,
            } => {
                write_address(buf, remote_address);
                for address in internal_addresses.iter() {
                    write_address(buf, address);
                }
            }
            Packet::DisconnectionNotification => {}
            Packet::IncompatibleProtocolVersion { version, guid } => {
                buf.put_u8(*version);
                buf.put_slice(&MAGIC);
                buf.put_u64(*guid);
            }
            Packet::UnconnectedPong {
                guid,
                remote_time,
                status,
            } => {
                buf.put_u64(*remote_time);
                buf.put_u64(*guid);
                buf.put_slice(&MAGIC);
                debug_assert!(status.len() < u16::MAX as usize);
                buf.put_u16(status.len() as u16);
                buf.put_slice(status);
            }
            Packet::Game(payload) => {
                buf.put_slice(payload);
            }
            Packet::FrameSet(_) | Packet::Ack(_) | Packet::Nack(_) => {}
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod test {
    use std::net::{Ipv6Addr, SocketAddrV6};

    use super::*;

    fn roundtrip(packet: Packet) {
        let mut encoded = packet.encode();
        let decoded = Packet::decode(&mut encoded).unwrap();
        assert_eq!(decoded, packet);
        assert!(!encoded.has_remaining(), "trailing bytes after decode");
    }

    #[test]
    fn test_packet_roundtrip() {
        let v4: SocketAddr = "192.168.1.17:19132".parse().unwrap();
        let v6 = SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::new(0xfe80, 0, 0, 0, 0x1234, 0, 0, 0x5678),
            19133,
            7,
            3,
        ));
        let packets = [
            Packet::ConnectedPing { local_time: 12345 },
            Packet::UnconnectedPing {
                guid: 0xdead_beef_cafe_f00d,
                local_time: 98765,
            },
            Packet::UnconnectedPingOpenConnections {
                guid: 1,
                local_time: 2,
            },
            Packet::ConnectedPong {
                remote_time: 3,
                local_time: 4,
            },
            Packet::OpenConnectionReply1 {
                guid: 42,
                mtu: 1446,
                security: false,
            },
            Packet::OpenConnectionRequest2 {
                guid: 42,
                mtu: 1200,
                remote_address: v4,
            },
            Packet::OpenConnectionReply2 {
                guid: 42,
                mtu: 1200,
                remote_address: v6,
                encryption: false,
            },
            Packet::ConnectionRequest {
                guid: 42,
                local_time: 0,
                security: false,
            },
            Packet::ConnectionRequestAccepted {
                remote_address: v4,
                system_idx: 0,
                internal_addresses: Box::new([empty_address(); 20]),
                remote_time: 5,
                local_time: 6,
            },
            Packet::NewIncomingConnection {
                remote_address: v6,
                internal_addresses: Box::new([empty_address(); 10]),
            },
            Packet::DisconnectionNotification,
            Packet::IncompatibleProtocolVersion {
                version: 10,
                guid: 42,
            },
            Packet::UnconnectedPong {
                guid: 42,
                remote_time: 7,
                status: Bytes::from_static(b"MCPE;demo;0;0;0;10"),
            },
            Packet::Game(Bytes::from_static(b"\x01\x02\x03\x04")),
            Packet::Ack(AckOrNack::from_sorted([1, 2, 3, 7].into_iter()).unwrap()),
            Packet::Nack(AckOrNack::from_sorted(std::iter::once(0)).unwrap()),
        ];
        for packet in packets {
            roundtrip(packet);
        }
    }

    #[test]
    fn test_request1_padding_preserves_mtu() {
        let packet = Packet::OpenConnectionRequest1 {
            mtu: 1446,
            version: 10,
        };
        let mut encoded = packet.encode();
        // ident + magic + version + padding, padding + 46 = mtu
        assert_eq!(encoded.len(), 1 + 16 + 1 + (1446 - 46));
        assert_eq!(Packet::decode(&mut encoded).unwrap(), packet);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut encoded = BytesMut::new();
        Packet::UnconnectedPing {
            guid: 1,
            local_time: 2,
        }
        .write(&mut encoded);
        encoded[9] ^= 0xff;
        assert_eq!(
            Packet::decode(&mut encoded.freeze()),
            Err(CodecError::BadMagic)
        );
    }

    #[test]
    fn test_unknown_ident_rejected() {
        let mut data = Bytes::from_static(&[0x42, 0x00]);
        assert_eq!(
            Packet::decode(&mut data),
            Err(CodecError::UnknownPackId(0x42))
        );
    }

    #[test]
    fn test_truncated_packet_underruns() {
        let mut data = Bytes::from_static(&[0x00, 0x01, 0x02]);
        assert_eq!(Packet::decode(&mut data), Err(CodecError::Underrun));
    }

    #[test]
    fn test_address_wire_sizes() {
        let mut buf = BytesMut::new();
        write_address(&mut buf, &"10.0.0.1:80".parse().unwrap());
        assert_eq!(buf.len(), 7);
        buf.clear();
        write_address(&mut buf, &"[::1]:80".parse().unwrap());
        assert_eq!(buf.len(), 29);
        let decoded = read_address(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, "[::1]:80".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_invalid_address_family() {
        let mut data = Bytes::from_static(&[5, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            read_address(&mut data),
            Err(CodecError::InvalidAddressFamily(5))
        );
    }
}
