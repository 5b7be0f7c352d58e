use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors surfaced by the protocol core.
///
/// `DuplicatePacket` is deliberately an error kind: the incoming sequence
/// tracker reports it so a handler can acknowledge and drop in one match arm.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("checksum verification failed")]
    BadChecksum,

    #[error("TTL expired, packet cannot be forwarded")]
    TtlExpired,

    #[error("no route to destination {0}")]
    UnreachableDestination(Ipv4Addr),

    #[error("packet number {pkt_num} exceeds congestion window ({lower}, {upper}] for {dest}")]
    CongestionWindowFull {
        dest: Ipv4Addr,
        pkt_num: i64,
        lower: i64,
        upper: i64,
    },

    #[error("packet number {pkt_num} from {src_addr} is more than {window} ahead of the highest contiguous number {highest}")]
    WindowExceeded {
        src_addr: Ipv4Addr,
        pkt_num: i64,
        highest: i64,
        window: i64,
    },

    #[error("duplicate packet")]
    DuplicatePacket,

    #[error("peer did not acknowledge, giving up")]
    PeerGone,

    #[error("packet destination {0} is not the local address")]
    NotLocal(Ipv4Addr),

    #[error("another {msg_type:?} stream to {dest} is already in flight")]
    StreamBusy {
        dest: Ipv4Addr,
        msg_type: crate::packet::MsgType,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
