use anyhow::bail;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a node's protocol stack.
///
/// The defaults reproduce the wire-compatible behavior of the reference
/// deployment: a 16-byte header inside common-MTU Ethernet frames, five-second
/// ACK timeouts with two retries, and a receive window of 1000 packet numbers
/// per peer.
pub struct ProtocolConfig {
    /// TTL stamped on every locally originated packet.
    pub initial_ttl: u8,

    /// Three-bit team identifier packed into the control byte.
    pub team_id: u8,

    /// Maximum payload bytes per packet, after all headers (IP, UDP, overlay)
    /// are subtracted from the assumed MTU.
    ///
    /// Choosing this too big causes datagrams to be dropped by links with
    /// smaller frames; choosing it too small wastes bandwidth. The protocol
    /// does not attempt path-MTU discovery.
    pub max_payload: usize,

    /// Bytes read from the UDP socket per datagram. Must be at least a common
    /// Ethernet MTU so no valid packet is truncated.
    pub udp_buffer_size: usize,

    /// Capacity of each subscriber's datagram channel on the socket adapter.
    /// Publication is non-blocking; datagrams beyond this are dropped for the
    /// lagging subscriber.
    pub socket_channel_capacity: usize,

    /// Maximum number of concurrently running packet handlers. Datagrams
    /// arriving while all permits are taken are dropped.
    pub max_concurrent_handlers: usize,

    /// How long to wait for an ACK before retransmitting. Also the cooldown
    /// after a congestion event during which further timeouts do not shrink
    /// the window again.
    pub ack_timeout: Duration,

    /// Retransmissions per packet before the waiter completes with `false`.
    pub retries_per_packet: u32,

    /// Congestion window floor, and its value for a fresh destination.
    pub initial_cwnd: i64,

    /// Delay between attempts to register a packet while the congestion
    /// window is full.
    pub cwnd_full_retry_delay: Duration,

    /// Maximum distance a received packet number may be ahead of the highest
    /// contiguous one before it is rejected.
    pub receiver_window: i64,

    /// Capacity of the event channel handed to the application. Events beyond
    /// this are dropped rather than blocking a handler.
    pub event_channel_capacity: usize,

    /// Directory reassembled files are moved into.
    pub received_files_dir: PathBuf,
}

impl Default for ProtocolConfig {
    fn default() -> ProtocolConfig {
        ProtocolConfig {
            initial_ttl: 30,
            team_id: 0x2,
            max_payload: 1200,
            udp_buffer_size: 1500,
            socket_channel_capacity: 10,
            max_concurrent_handlers: 64,
            ack_timeout: Duration::from_secs(5),
            retries_per_packet: 2,
            initial_cwnd: 2,
            cwnd_full_retry_delay: Duration::from_millis(10),
            receiver_window: 1000,
            event_channel_capacity: 64,
            received_files_dir: default_received_files_dir(),
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload == 0 || self.max_payload > 1484 {
            bail!("max_payload must be in 1..=1484 so a packet fits a 1500-byte datagram");
        }
        if self.udp_buffer_size < 1500 {
            bail!("udp_buffer_size must be at least 1500");
        }
        if self.initial_cwnd < 1 {
            bail!("initial_cwnd must be at least 1");
        }
        if self.retries_per_packet == 0 {
            bail!("retries_per_packet must be at least 1");
        }
        if self.receiver_window < 1 {
            bail!("receiver_window must be at least 1");
        }
        if self.max_concurrent_handlers == 0 {
            bail!("max_concurrent_handlers must be at least 1");
        }
        Ok(())
    }
}

/// `~/chatprotogol_received_files`, or `/chatprotogol_received_files` when no
/// home directory can be determined.
fn default_received_files_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join("chatprotogol_received_files")
}
