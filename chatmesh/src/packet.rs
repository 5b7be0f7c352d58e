use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;

/// Serialized header size. Every valid datagram is at least this long.
pub const HEADER_LEN: usize = 16;

/// The four-bit message type packed into the upper nibble of the control byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MsgType {
    Connect = 0,
    Disconnect = 1,
    DatabaseDescription = 2,
    LinkState = 3,
    ChatMessage = 4,
    FileTransfer = 5,
    Ack = 6,
    Finish = 7,
}

/// Fixed 16-byte packet header, all fields big-endian on the wire.
///
/// The control byte packs `(msg_type << 4) | (last_bit << 3) | team_id`. The
/// last bit is carried for wire compatibility; stream termination is signaled
/// by [`MsgType::Finish`] packets, so nothing branches on it.
#[derive(Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub source: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub control: u8,
    pub ttl: u8,
    pub checksum: u16,
    pub pkt_num: u32,
}

impl PacketHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.source.into());
        buf.put_u32(self.dest.into());
        buf.put_u8(self.control);
        buf.put_u8(self.ttl);
        buf.put_u16(self.checksum);
        buf.put_u32(self.pkt_num);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader, ProtocolError> {
        if buf.remaining() < HEADER_LEN {
            return Err(ProtocolError::MalformedPacket(format!(
                "datagram of {} bytes is shorter than the {} byte header",
                buf.remaining(),
                HEADER_LEN
            )));
        }
        Ok(PacketHeader {
            source: Ipv4Addr::from(buf.get_u32()),
            dest: Ipv4Addr::from(buf.get_u32()),
            control: buf.get_u8(),
            ttl: buf.get_u8(),
            checksum: buf.get_u16(),
            pkt_num: buf.get_u32(),
        })
    }
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{src:{} dest:{} type:{:?} last:{} team:{} ttl:{} chksum:{:#06x} pkt:{}}}",
            self.source,
            self.dest,
            msg_type_of_control(self.control),
            self.control & 0b1000 != 0,
            self.control & 0b111,
            self.ttl,
            self.checksum,
            self.pkt_num,
        )
    }
}

fn msg_type_of_control(control: u8) -> Result<MsgType, u8> {
    let raw = control >> 4;
    MsgType::try_from(raw).map_err(|_| raw)
}

/// A complete datagram: header plus opaque payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Parse a received datagram. Fails on anything shorter than the header.
    pub fn parse(data: &[u8]) -> Result<Packet, ProtocolError> {
        let mut buf = data;
        let header = PacketHeader::deser(&mut buf)?;
        Ok(Packet {
            header,
            payload: buf.to_vec(),
        })
    }

    /// Serialize into a freshly allocated buffer: header fields in big-endian
    /// order followed by the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.ser(&mut buf);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn msg_type(&self) -> Result<MsgType, ProtocolError> {
        msg_type_of_control(self.header.control).map_err(|raw| {
            ProtocolError::MalformedPacket(format!("unknown message type {raw:#x}"))
        })
    }

    pub fn is_last(&self) -> bool {
        self.header.control & 0b1000 != 0
    }

    pub fn team_id(&self) -> u8 {
        self.header.control & 0b111
    }

    /// Compute and store the checksum. The packet must not be modified
    /// afterwards, except by calling `set_checksum` again.
    pub fn set_checksum(&mut self) {
        self.header.checksum = 0;
        self.header.checksum = !ones_complement_sum(&self.to_bytes());
    }

    /// A packet is intact iff the folded 1's-complement sum over all of its
    /// bytes, including the stored checksum, is `0xFFFF`.
    pub fn verify_checksum(&self) -> bool {
        ones_complement_sum(&self.to_bytes()) == 0xFFFF
    }

    /// Checksum gate the dispatcher runs before anything else touches a
    /// received packet.
    pub fn check_integrity(&self) -> Result<(), ProtocolError> {
        if self.verify_checksum() {
            Ok(())
        } else {
            Err(ProtocolError::BadChecksum)
        }
    }
}

/// Packs a control byte from its three fields. `msg_type` occupies the upper
/// nibble, the last bit sits at bit 3, and `team_id` fills the low three bits.
pub fn control_byte(msg_type: MsgType, last_bit: bool, team_id: u8) -> u8 {
    debug_assert!(team_id <= 0b111, "team id must fit in 3 bits");

    let mut control = u8::from(msg_type) << 4;
    if last_bit {
        control |= 0b1000;
    }
    control | (team_id & 0b111)
}

/// Payload of a Link-State Advertisement: the owning host, its LSA sequence
/// number, and the owner's direct neighbors, all fields big-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LsaPayload {
    pub owner: Ipv4Addr,
    pub seq_num: u32,
    pub neighbors: Vec<Ipv4Addr>,
}

impl LsaPayload {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.owner.into());
        buf.put_u32(self.seq_num);
        for neighbor in &self.neighbors {
            buf.put_u32((*neighbor).into());
        }
    }

    pub fn deser(payload: &[u8]) -> Result<LsaPayload, ProtocolError> {
        if payload.len() < 8 || (payload.len() - 8) % 4 != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "LSA payload of {} bytes is not 8 + 4n",
                payload.len()
            )));
        }

        let mut buf = payload;
        let owner = Ipv4Addr::from(buf.get_u32());
        let seq_num = buf.get_u32();
        let mut neighbors = Vec::with_capacity(buf.remaining() / 4);
        while buf.has_remaining() {
            neighbors.push(Ipv4Addr::from(buf.get_u32()));
        }

        Ok(LsaPayload {
            owner,
            seq_num,
            neighbors,
        })
    }
}

/// Payload of a Database Description: every address the sender has an LSA of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DdPayload {
    pub addrs: Vec<Ipv4Addr>,
}

impl DdPayload {
    pub fn ser(&self, buf: &mut BytesMut) {
        for addr in &self.addrs {
            buf.put_u32((*addr).into());
        }
    }

    pub fn deser(payload: &[u8]) -> Result<DdPayload, ProtocolError> {
        if payload.len() % 4 != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "DD payload of {} bytes is not a multiple of 4",
                payload.len()
            )));
        }

        let mut buf = payload;
        let mut addrs = Vec::with_capacity(buf.remaining() / 4);
        while buf.has_remaining() {
            addrs.push(Ipv4Addr::from(buf.get_u32()));
        }

        Ok(DdPayload { addrs })
    }
}

/// Payload of a FIN: the packet number of the stream's last chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinPayload {
    pub last_pkt_num: u32,
}

impl FinPayload {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.last_pkt_num);
    }

    pub fn deser(payload: &[u8]) -> Result<FinPayload, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::MalformedPacket(
                "FIN payload is shorter than 4 bytes".to_string(),
            ));
        }
        let mut buf = payload;
        Ok(FinPayload {
            last_pkt_num: buf.get_u32(),
        })
    }
}

/// 16-bit 1's-complement sum over `data`, big-endian word order, an odd final
/// byte padded onto the high half of its word, carries folded back in.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            (u32::from(chunk[0]) << 8) | u32::from(chunk[1])
        } else {
            u32::from(chunk[0]) << 8
        };
        sum += word;
    }

    while sum >> 16 > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample_packet(payload: Vec<u8>) -> Packet {
        Packet {
            header: PacketHeader {
                source: Ipv4Addr::new(10, 0, 0, 1),
                dest: Ipv4Addr::new(10, 0, 0, 2),
                control: control_byte(MsgType::ChatMessage, false, 0x2),
                ttl: 30,
                checksum: 0,
                pkt_num: 42,
            },
            payload,
        }
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one_byte(vec![0xAB])]
    #[case::even(vec![1, 2, 3, 4])]
    #[case::odd(vec![1, 2, 3, 4, 5])]
    #[case::all_ff(vec![0xFF; 33])]
    fn test_checksum_roundtrip(#[case] payload: Vec<u8>) {
        let mut packet = sample_packet(payload);
        packet.set_checksum();
        assert!(packet.verify_checksum());
    }

    #[test]
    fn test_checksum_detects_any_single_bit_flip() {
        let mut packet = sample_packet(vec![0xDE, 0xAD, 0xBE, 0xEF, 0x42]);
        packet.set_checksum();

        let good = packet.to_bytes();
        for byte_idx in 0..good.len() {
            for bit in 0..8 {
                let mut corrupted = good.clone();
                corrupted[byte_idx] ^= 1 << bit;
                let reparsed = Packet::parse(&corrupted).unwrap();
                assert!(
                    !reparsed.verify_checksum(),
                    "flip of bit {bit} in byte {byte_idx} went undetected"
                );
            }
        }
    }

    #[rstest]
    #[case(MsgType::Connect, false, 0x2)]
    #[case(MsgType::Disconnect, true, 0x7)]
    #[case(MsgType::Finish, true, 0x0)]
    #[case(MsgType::Ack, false, 0x5)]
    fn test_control_byte_fields(#[case] msg_type: MsgType, #[case] last: bool, #[case] team: u8) {
        let packet = Packet {
            header: PacketHeader {
                control: control_byte(msg_type, last, team),
                ..sample_packet(vec![]).header
            },
            payload: vec![],
        };
        assert_eq!(packet.msg_type().unwrap(), msg_type);
        assert_eq!(packet.is_last(), last);
        assert_eq!(packet.team_id(), team);
    }

    #[test]
    fn test_unknown_msg_type_is_malformed() {
        let mut packet = sample_packet(vec![]);
        packet.header.control = 0x9 << 4;
        assert!(matches!(
            packet.msg_type(),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[rstest]
    #[case::empty_payload(vec![])]
    #[case::with_payload(vec![9, 8, 7])]
    fn test_serialization_roundtrip(#[case] payload: Vec<u8>) {
        let mut packet = sample_packet(payload);
        packet.set_checksum();

        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + packet.payload.len());

        let reparsed = Packet::parse(&bytes).unwrap();
        assert_eq!(reparsed, packet);
    }

    #[test]
    fn test_header_bijection_on_raw_bytes() {
        let raw: Vec<u8> = (0..HEADER_LEN as u8).collect();
        let packet = Packet::parse(&raw).unwrap();
        assert_eq!(packet.to_bytes(), raw);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(15)]
    fn test_parse_rejects_short_datagrams(#[case] len: usize) {
        let data = vec![0u8; len];
        assert!(matches!(
            Packet::parse(&data),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[rstest]
    #[case::no_neighbors(LsaPayload { owner: Ipv4Addr::new(10,0,0,1), seq_num: 0, neighbors: vec![] })]
    #[case::two_neighbors(LsaPayload { owner: Ipv4Addr::new(10,0,0,1), seq_num: 17, neighbors: vec![Ipv4Addr::new(10,0,0,2), Ipv4Addr::new(10,0,0,3)] })]
    fn test_lsa_payload_roundtrip(#[case] lsa: LsaPayload) {
        let mut buf = BytesMut::new();
        lsa.ser(&mut buf);
        assert_eq!(LsaPayload::deser(&buf).unwrap(), lsa);
    }

    #[rstest]
    #[case::too_short(7)]
    #[case::ragged(10)]
    fn test_lsa_payload_rejects_bad_lengths(#[case] len: usize) {
        assert!(matches!(
            LsaPayload::deser(&vec![0u8; len]),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_dd_payload_roundtrip() {
        let dd = DdPayload {
            addrs: vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
        };
        let mut buf = BytesMut::new();
        dd.ser(&mut buf);
        assert_eq!(DdPayload::deser(&buf).unwrap(), dd);

        assert!(DdPayload::deser(&[1, 2, 3]).is_err());
        assert_eq!(DdPayload::deser(&[]).unwrap().addrs, Vec::<Ipv4Addr>::new());
    }

    #[test]
    fn test_fin_payload_roundtrip() {
        let fin = FinPayload { last_pkt_num: 0xCAFE };
        let mut buf = BytesMut::new();
        fin.ser(&mut buf);
        assert_eq!(FinPayload::deser(&buf).unwrap(), fin);

        assert!(FinPayload::deser(&[0, 0, 1]).is_err());
    }

    #[test]
    fn test_known_wire_layout() {
        let mut packet = sample_packet(vec![0x11, 0x22]);
        packet.header.pkt_num = 0x01020304;
        let bytes = packet.to_bytes();

        assert_eq!(&bytes[0..4], &[10, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[10, 0, 0, 2]);
        assert_eq!(bytes[8], (4 << 4) | 0x2);
        assert_eq!(bytes[9], 30);
        assert_eq!(&bytes[12..16], &[1, 2, 3, 4]);
        assert_eq!(&bytes[16..], &[0x11, 0x22]);
    }
}
