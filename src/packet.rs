use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::rpc::RpcId;

/// Packet type tags as they appear on the wire
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketType {
    Data = 0x10,
    Grant = 0x11,
    Resend = 0x12,
    Unknown = 0x13,
    Busy = 0x14,
    Cutoffs = 0x15,
    NeedAck = 0x16,
    Ack = 0x17,
}
impl PacketType {
    pub const ALL: [PacketType; 8] = [
        PacketType::Data,
        PacketType::Grant,
        PacketType::Resend,
        PacketType::Unknown,
        PacketType::Busy,
        PacketType::Cutoffs,
        PacketType::NeedAck,
        PacketType::Ack,
    ];

    /// dense index for per-type counters
    pub fn index(&self) -> usize {
        (u8::from(*self) - u8::from(PacketType::Data)) as usize
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct DataFlags: u8 {
        const RETRANSMIT = 0b0000_0001;
    }
}

/// The header every packet starts with.
///
/// `sender_id` is the id of the RPC on the sending side; the receiver's id for the same RPC
///  has the low bit flipped (see [RpcId::peer_id]).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CommonHeader {
    pub sport: u16,
    pub dport: u16,
    pub sender_id: RpcId,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataHeader {
    /// total length of the message this segment belongs to
    pub message_length: u32,
    /// the number of bytes of the message the sender is currently allowed to transmit
    pub incoming: u32,
    pub offset: u32,
    pub flags: DataFlags,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PacketBody {
    Data { header: DataHeader, payload: Bytes },
    /// The receiver allows transmission of the message up to (excluding) `offset`
    Grant { offset: u32, priority: u8 },
    Resend { offset: u32, length: u32, priority: u8 },
    /// The receiver has no record of the RPC
    Unknown,
    /// The sender is alive but has nothing to send at the moment
    Busy,
    Cutoffs { unsched_cutoffs: [u32; 8], version: u16 },
    NeedAck,
    Ack,
    /// A type tag this implementation does not know
    Unrecognized(u8),
}

#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub common: CommonHeader,
    pub body: PacketBody,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{}->{} #{}: {}}}", self.common.sport, self.common.dport, self.common.sender_id, self)
    }
}

/// Short summary of the packet's content, e.g. `DATA 1400@2800`
impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            PacketBody::Data { header, payload } => {
                write!(f, "DATA {}@{}", payload.len(), header.offset)?;
                if header.flags.contains(DataFlags::RETRANSMIT) {
                    write!(f, " retrans")?;
                }
                Ok(())
            }
            PacketBody::Grant { offset, priority } => write!(f, "GRANT {}@{}", offset, priority),
            PacketBody::Resend { offset, length, priority } => {
                write!(f, "RESEND {}-{}@{}", offset, (*offset + *length).saturating_sub(1), priority)
            }
            PacketBody::Unknown => write!(f, "UNKNOWN"),
            PacketBody::Busy => write!(f, "BUSY"),
            PacketBody::Cutoffs { version, .. } => write!(f, "CUTOFFS v{}", version),
            PacketBody::NeedAck => write!(f, "NEED_ACK"),
            PacketBody::Ack => write!(f, "ACK"),
            PacketBody::Unrecognized(t) => write!(f, "UNRECOGNIZED({})", t),
        }
    }
}

impl Packet {
    /// sport + dport + type + sender id
    pub const COMMON_HEADER_LEN: usize = 2 + 2 + 1 + 8;

    pub fn new(sport: u16, dport: u16, sender_id: RpcId, body: PacketBody) -> Packet {
        Packet {
            common: CommonHeader { sport, dport, sender_id },
            body,
        }
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        match &self.body {
            PacketBody::Data { .. } => Some(PacketType::Data),
            PacketBody::Grant { .. } => Some(PacketType::Grant),
            PacketBody::Resend { .. } => Some(PacketType::Resend),
            PacketBody::Unknown => Some(PacketType::Unknown),
            PacketBody::Busy => Some(PacketType::Busy),
            PacketBody::Cutoffs { .. } => Some(PacketType::Cutoffs),
            PacketBody::NeedAck => Some(PacketType::NeedAck),
            PacketBody::Ack => Some(PacketType::Ack),
            PacketBody::Unrecognized(_) => None,
        }
    }

    fn type_tag(&self) -> u8 {
        if let PacketBody::Unrecognized(t) = self.body {
            return t;
        }
        self.packet_type().map(u8::from).unwrap_or_default()
    }

    /// The key the incoming scheduler orders a batch by: the declared total length of the
    ///  message a DATA packet belongs to. Control packets carry no message and sort first.
    pub fn scheduling_key(&self) -> u32 {
        match &self.body {
            PacketBody::Data { header, .. } => header.message_length,
            _ => 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.common.sport);
        buf.put_u16(self.common.dport);
        buf.put_u8(self.type_tag());
        buf.put_u64(self.common.sender_id.0);

        match &self.body {
            PacketBody::Data { header, payload } => {
                buf.put_u32(header.message_length);
                buf.put_u32(header.incoming);
                buf.put_u32(header.offset);
                buf.put_u8(header.flags.bits());
                buf.put_slice(payload);
            }
            PacketBody::Grant { offset, priority } => {
                buf.put_u32(*offset);
                buf.put_u8(*priority);
            }
            PacketBody::Resend { offset, length, priority } => {
                buf.put_u32(*offset);
                buf.put_u32(*length);
                buf.put_u8(*priority);
            }
            PacketBody::Cutoffs { unsched_cutoffs, version } => {
                for c in unsched_cutoffs {
                    buf.put_u32(*c);
                }
                buf.put_u16(*version);
            }
            PacketBody::Unknown |
            PacketBody::Busy |
            PacketBody::NeedAck |
            PacketBody::Ack |
            PacketBody::Unrecognized(_) => {}
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::COMMON_HEADER_LEN + 13 + self.payload_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    fn payload_len(&self) -> usize {
        match &self.body {
            PacketBody::Data { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    /// Parses a packet. Packets with a type tag that is not known are returned as
    ///  [PacketBody::Unrecognized] rather than as an error so that the caller can account for
    ///  them; truncated packets and inconsistent DATA headers are errors.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        if buf.remaining() < Self::COMMON_HEADER_LEN {
            bail!("packet of {} bytes is shorter than the common header", buf.remaining());
        }

        let sport = buf.try_get_u16()?;
        let dport = buf.try_get_u16()?;
        let type_tag = buf.try_get_u8()?;
        let sender_id = RpcId(buf.try_get_u64()?);
        let common = CommonHeader { sport, dport, sender_id };

        let packet_type = match PacketType::try_from_primitive(type_tag) {
            Ok(t) => t,
            Err(_) => return Ok(Packet { common, body: PacketBody::Unrecognized(type_tag) }),
        };

        let body = match packet_type {
            PacketType::Data => {
                let message_length = buf.try_get_u32()?;
                let incoming = buf.try_get_u32()?;
                let offset = buf.try_get_u32()?;
                let flags = DataFlags::from_bits_truncate(buf.try_get_u8()?);
                let payload = buf.copy_to_bytes(buf.remaining());

                if message_length == 0 {
                    bail!("DATA packet for an empty message");
                }
                if offset as u64 + payload.len() as u64 > message_length as u64 {
                    bail!("DATA segment {}@{} extends beyond the message length {}", payload.len(), offset, message_length);
                }
                PacketBody::Data {
                    header: DataHeader { message_length, incoming, offset, flags },
                    payload,
                }
            }
            PacketType::Grant => PacketBody::Grant {
                offset: buf.try_get_u32()?,
                priority: buf.try_get_u8()?,
            },
            PacketType::Resend => PacketBody::Resend {
                offset: buf.try_get_u32()?,
                length: buf.try_get_u32()?,
                priority: buf.try_get_u8()?,
            },
            PacketType::Unknown => PacketBody::Unknown,
            PacketType::Busy => PacketBody::Busy,
            PacketType::Cutoffs => {
                let mut unsched_cutoffs = [0u32; 8];
                for c in unsched_cutoffs.iter_mut() {
                    *c = buf.try_get_u32()?;
                }
                PacketBody::Cutoffs {
                    unsched_cutoffs,
                    version: buf.try_get_u16()?,
                }
            }
            PacketType::NeedAck => PacketBody::NeedAck,
            PacketType::Ack => PacketBody::Ack,
        };
        Ok(Packet { common, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn data(message_length: u32, offset: u32, payload: &'static [u8]) -> Packet {
        Packet::new(40, 99, RpcId(1234), PacketBody::Data {
            header: DataHeader { message_length, incoming: message_length, offset, flags: DataFlags::empty() },
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn test_data_wire_layout() {
        let bytes = data(5, 2, b"abc").to_bytes();
        assert_eq!(bytes.as_ref(), &[
            0,40, 0,99, 0x10, 0,0,0,0,0,0,4,210,
            0,0,0,5, 0,0,0,5, 0,0,0,2, 0,
            b'a', b'b', b'c',
        ]);
    }

    #[rstest]
    #[case::data(data(1000, 200, b"xyz"))]
    #[case::grant(Packet::new(1, 2, RpcId(3), PacketBody::Grant { offset: 11400, priority: 3 }))]
    #[case::resend(Packet::new(1, 2, RpcId(3), PacketBody::Resend { offset: 1400, length: 2800, priority: 7 }))]
    #[case::busy(Packet::new(1, 2, RpcId(3), PacketBody::Busy))]
    #[case::cutoffs(Packet::new(1, 2, RpcId(3), PacketBody::Cutoffs { unsched_cutoffs: [1, 2, 3, 4, 5, 6, 7, 8], version: 2 }))]
    #[case::ack(Packet::new(1, 2, RpcId(3), PacketBody::Ack))]
    fn test_ser_deser(#[case] packet: Packet) {
        let mut buf = packet.to_bytes();
        let deser = Packet::deser(&mut buf).unwrap();
        assert_eq!(deser, packet);
        assert_eq!(buf.remaining(), 0);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_common(vec![0,1, 0,2, 0x10, 0,0,0])]
    #[case::short_data(vec![0,1, 0,2, 0x10, 0,0,0,0,0,0,0,1, 0,0,0,9])]
    #[case::short_grant(vec![0,1, 0,2, 0x11, 0,0,0,0,0,0,0,1, 0,0])]
    #[case::empty_message(vec![0,1, 0,2, 0x10, 0,0,0,0,0,0,0,1, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0])]
    #[case::beyond_length(vec![0,1, 0,2, 0x10, 0,0,0,0,0,0,0,1, 0,0,0,2, 0,0,0,2, 0,0,0,1, 0, 1,2])]
    fn test_deser_invalid(#[case] buf: Vec<u8>) {
        assert!(Packet::deser(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_deser_unrecognized_type() {
        let buf = vec![0,1, 0,2, 0x7f, 0,0,0,0,0,0,0,1, 9,9,9];
        let packet = Packet::deser(&mut buf.as_slice()).unwrap();
        assert_eq!(packet.body, PacketBody::Unrecognized(0x7f));
        assert_eq!(packet.packet_type(), None);
    }

    #[rstest]
    #[case::data(data(5000, 0, b"a"), 5000)]
    #[case::grant(Packet::new(1, 2, RpcId(3), PacketBody::Grant { offset: 99999, priority: 0 }), 0)]
    fn test_scheduling_key(#[case] packet: Packet, #[case] expected: u32) {
        assert_eq!(packet.scheduling_key(), expected);
    }

    #[rstest]
    #[case::data(data(5000, 1400, b"ab"), "DATA 2@1400")]
    #[case::resend(Packet::new(1, 2, RpcId(3), PacketBody::Resend { offset: 1400, length: 1400, priority: 7 }), "RESEND 1400-2799@7")]
    #[case::grant(Packet::new(1, 2, RpcId(3), PacketBody::Grant { offset: 11400, priority: 2 }), "GRANT 11400@2")]
    fn test_display(#[case] packet: Packet, #[case] expected: &str) {
        assert_eq!(packet.to_string(), expected);
    }

    #[test]
    fn test_type_index() {
        for (i, t) in PacketType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }
}
