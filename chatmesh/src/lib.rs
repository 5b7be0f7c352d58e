//! A peer-to-peer chat overlay that implements its own reliable, routed
//! datagram protocol on top of UDP. Hosts are identified by their IPv4
//! address; directly connected hosts form an undirected graph over which
//! Link-State Advertisements are flooded, shortest paths are computed with
//! Dijkstra, and application payloads (chat messages, file chunks) are
//! forwarded end-to-end with per-destination packet numbering, selective
//! retransmission and TCP-like congestion control.
//!
//! ## Wire format
//!
//! Every datagram starts with a fixed 16-byte header, all fields big-endian:
//!
//! ```ascii
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                     Source IPv4 Address (32 bits)                     |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                  Destination IPv4 Address (32 bits)                   |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |  Msg   |  Last  |  Team  |        |                                   |
//! |  Type  |  Bit   |   ID   |  TTL   |        Checksum (16 bits)         |
//! |(4 bits)|(1 bit) |(3 bits)|(8 bits)|                                   |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                       Packet Number (32 bits)                         |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! The checksum is the 16-bit 1's-complement of the 1's-complement sum over
//! the whole packet with the checksum field zeroed; a received packet is
//! intact iff the folded sum over all its bytes equals `0xFFFF`.
//!
//! Message types: CONN(0) DIS(1) DD(2) LSA(3) MSG(4) FILE(5) ACK(6) FIN(7).
//!
//! ## Protocol outline
//!
//! * **Handshake**: `con` sends a CONN straight to an address and port. The
//!   responder ACKs, adds the neighbor, floods its updated local LSA and
//!   answers with a Database Description summarizing its LSDB; the initiator
//!   mirrors this once the ACK arrives. Missing LSAs named in a DD are
//!   flooded back, so both sides converge on the same topology.
//! * **Routing**: each host floods an LSA (owner, sequence number, neighbor
//!   list) whenever its neighborhood changes. Received LSAs are re-flooded to
//!   every neighbor except the one they came from. The routing table is the
//!   shortest-path next-hop tree over the LSDB.
//! * **Reliability**: every packet to a destination carries a fresh packet
//!   number from a per-destination counter. The receiver ACKs everything
//!   addressed to it and detects duplicates; the sender keeps an open ack per
//!   in-flight packet, retransmits on timeout and bounds the number of
//!   in-flight packets with a congestion window (slow start, congestion
//!   avoidance, multiplicative decrease on loss).
//! * **Streams**: multi-chunk payloads are reassembled per source, messages
//!   in memory and files on disk, and committed by a FIN carrying the packet
//!   number of the last chunk.
//!
//! Encryption, authentication, NAT traversal and IPv6 are out of scope.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod packet;
pub mod reconstruction;
pub mod routing;
pub mod send_pipeline;
pub mod sequencing;
pub mod socket;

mod node;

pub use config::ProtocolConfig;
pub use dispatcher::Event;
pub use error::ProtocolError;
pub use node::Node;
