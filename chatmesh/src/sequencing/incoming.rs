use crate::error::ProtocolError;
use crate::packet::Packet;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Debug)]
struct PeerSeqState {
    /// Highest packet number up to which everything was received, `-1` before
    /// the first packet.
    highest_contiguous: i64,
    /// Received numbers beyond the contiguous prefix. All members are strictly
    /// greater than `highest_contiguous + 1` and at most `receiver_window`
    /// ahead of `highest_contiguous`.
    future: BTreeSet<i64>,
}

impl Default for PeerSeqState {
    fn default() -> PeerSeqState {
        PeerSeqState {
            highest_contiguous: -1,
            future: BTreeSet::new(),
        }
    }
}

/// Receiver-side duplicate detection, one window per source host.
///
/// Packets are not re-ordered here; the tracker only decides whether a packet
/// number was seen before and keeps the bounded set of out-of-order arrivals.
pub struct IncomingTracker {
    local_addr: Ipv4Addr,
    receiver_window: i64,
    state: Mutex<FxHashMap<Ipv4Addr, PeerSeqState>>,
}

impl IncomingTracker {
    pub fn new(local_addr: Ipv4Addr, receiver_window: i64) -> IncomingTracker {
        IncomingTracker {
            local_addr,
            receiver_window,
            state: Mutex::new(FxHashMap::default()),
        }
    }

    /// Record a packet destined for the local host and judge it.
    ///
    /// `Ok(())` means the packet number is new. `DuplicatePacket` means it was
    /// seen before (the caller acknowledges and drops). `WindowExceeded`
    /// rejects a number too far ahead of the contiguous prefix, and `NotLocal`
    /// rejects packets this tracker has no business judging.
    pub fn record(&self, packet: &Packet) -> Result<(), ProtocolError> {
        if packet.header.dest != self.local_addr {
            return Err(ProtocolError::NotLocal(packet.header.dest));
        }

        let mut state = self.state.lock().unwrap();
        let peer = state.entry(packet.header.source).or_default();
        let pkt_num = i64::from(packet.header.pkt_num);

        if pkt_num <= peer.highest_contiguous {
            return Err(ProtocolError::DuplicatePacket);
        }

        if pkt_num == peer.highest_contiguous + 1 {
            peer.highest_contiguous = pkt_num;
            // absorb future numbers that are contiguous now
            while peer.future.remove(&(peer.highest_contiguous + 1)) {
                peer.highest_contiguous += 1;
            }
            return Ok(());
        }

        // a gap: remember the number unless it is unreasonably far ahead
        if pkt_num - peer.highest_contiguous > self.receiver_window {
            return Err(ProtocolError::WindowExceeded {
                src_addr: packet.header.source,
                pkt_num,
                highest: peer.highest_contiguous,
                window: self.receiver_window,
            });
        }

        if !peer.future.insert(pkt_num) {
            return Err(ProtocolError::DuplicatePacket);
        }
        Ok(())
    }

    /// Highest contiguous packet number received from `peer`, `-1` if none.
    pub fn highest_contiguous(&self, peer: Ipv4Addr) -> i64 {
        self.state
            .lock()
            .unwrap()
            .get(&peer)
            .map(|s| s.highest_contiguous)
            .unwrap_or(-1)
    }

    /// Forget everything about `peer`.
    pub fn clear(&self, peer: Ipv4Addr) {
        self.state.lock().unwrap().remove(&peer);
    }
}
