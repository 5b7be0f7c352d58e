use crate::packet::MsgType;
use rustc_hash::FxHashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// Mutual exclusion for multi-chunk streams: at most one stream per
/// `(destination, message type)` pair may be in flight, so two messages (or
/// two files) to the same host cannot interleave their chunks.
#[derive(Default)]
pub struct SequenceBlockers {
    blocked: Mutex<FxHashSet<(Ipv4Addr, MsgType)>>,
}

impl SequenceBlockers {
    pub fn new() -> SequenceBlockers {
        SequenceBlockers::default()
    }

    /// Handle for one `(dest, msg_type)` pair. Creating the handle does not
    /// take ownership; call [`SequenceBlocker::block`].
    pub fn get(self: &Arc<Self>, dest: Ipv4Addr, msg_type: MsgType) -> SequenceBlocker {
        SequenceBlocker {
            blockers: Arc::clone(self),
            dest,
            msg_type,
        }
    }

    /// Release every blocker for `dest` at once, e.g. when the host becomes
    /// unreachable mid-stream.
    pub fn clear(&self, dest: Ipv4Addr) {
        self.blocked
            .lock()
            .unwrap()
            .retain(|(addr, _)| *addr != dest);
    }
}

pub struct SequenceBlocker {
    blockers: Arc<SequenceBlockers>,
    dest: Ipv4Addr,
    msg_type: MsgType,
}

impl SequenceBlocker {
    /// Try to take ownership of the pair. Returns `false` if another stream
    /// of the same type to the same destination is already in flight.
    pub fn block(&self) -> bool {
        self.blockers
            .blocked
            .lock()
            .unwrap()
            .insert((self.dest, self.msg_type))
    }

    /// Release ownership. A no-op if the pair is not blocked.
    pub fn unblock(&self) {
        self.blockers
            .blocked
            .lock()
            .unwrap()
            .remove(&(self.dest, self.msg_type));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn test_second_block_of_same_pair_fails() {
        let blockers = Arc::new(SequenceBlockers::new());

        let first = blockers.get(DEST, MsgType::ChatMessage);
        let second = blockers.get(DEST, MsgType::ChatMessage);

        assert!(first.block());
        assert!(!second.block());

        first.unblock();
        assert!(second.block());
    }

    #[test]
    fn test_pairs_are_independent() {
        let blockers = Arc::new(SequenceBlockers::new());
        let other = Ipv4Addr::new(10, 0, 0, 3);

        assert!(blockers.get(DEST, MsgType::ChatMessage).block());
        assert!(blockers.get(DEST, MsgType::FileTransfer).block());
        assert!(blockers.get(other, MsgType::ChatMessage).block());
    }

    #[test]
    fn test_clear_releases_all_blockers_of_dest() {
        let blockers = Arc::new(SequenceBlockers::new());
        let other = Ipv4Addr::new(10, 0, 0, 3);

        assert!(blockers.get(DEST, MsgType::ChatMessage).block());
        assert!(blockers.get(DEST, MsgType::FileTransfer).block());
        assert!(blockers.get(other, MsgType::ChatMessage).block());

        blockers.clear(DEST);

        assert!(blockers.get(DEST, MsgType::ChatMessage).block());
        assert!(blockers.get(DEST, MsgType::FileTransfer).block());
        assert!(!blockers.get(other, MsgType::ChatMessage).block());
    }

    #[test]
    fn test_unblock_without_block_is_noop() {
        let blockers = Arc::new(SequenceBlockers::new());
        blockers.get(DEST, MsgType::ChatMessage).unblock();
        assert!(blockers.get(DEST, MsgType::ChatMessage).block());
    }
}
