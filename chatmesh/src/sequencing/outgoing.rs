use crate::error::ProtocolError;
use crate::packet::Packet;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Future returned by a resend closure.
pub type ResendFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Called on every ACK timeout to put the packet back on the wire. Invoked
/// outside the tracker's lock.
pub type ResendFn = Box<dyn Fn() -> ResendFuture + Send + Sync>;

/// An unacknowledged sent packet: its retransmission timer task, remaining
/// retries, and the completion the sender is waiting on.
struct OpenAck {
    timer: Option<JoinHandle<()>>,
    retries_remaining: u32,
    waiter: Option<oneshot::Sender<bool>>,
}

struct PeerOutState {
    /// Packet number the next locally built packet for this peer gets.
    next_pkt_num: u32,
    open_acks: FxHashMap<u32, OpenAck>,
    /// Highest packet number up to which every packet was acknowledged or
    /// given up on, `-1` initially.
    highest_acked_contiguous: i64,
    cwnd: i64,
    ssthresh: i64,
    /// ACKs counted towards the next linear window increment while in
    /// congestion avoidance.
    avoidance_acc: i64,
    last_congestion_event: Option<Instant>,
}

impl PeerOutState {
    fn new(initial_cwnd: i64) -> PeerOutState {
        PeerOutState {
            next_pkt_num: 0,
            open_acks: FxHashMap::default(),
            highest_acked_contiguous: -1,
            cwnd: initial_cwnd,
            ssthresh: i64::MAX,
            avoidance_acc: 0,
            last_congestion_event: None,
        }
    }
}

enum TimeoutVerdict {
    /// The open ack disappeared, stop the timer task.
    Gone,
    /// Retransmit and keep the timer running.
    Resend,
    /// Retransmit one last time; the waiter has been completed with `false`.
    FinalResend,
}

/// Sender-side reliability state, one window per destination host: packet
/// numbering, open-ACK bookkeeping with retransmission timers, and a TCP-like
/// congestion window (slow start, congestion avoidance, multiplicative
/// decrease with an RTO cooldown).
pub struct OutgoingTracker {
    ack_timeout: Duration,
    retries_per_packet: u32,
    initial_cwnd: i64,
    state: Mutex<FxHashMap<Ipv4Addr, PeerOutState>>,
}

impl OutgoingTracker {
    pub fn new(ack_timeout: Duration, retries_per_packet: u32, initial_cwnd: i64) -> OutgoingTracker {
        OutgoingTracker {
            ack_timeout,
            retries_per_packet,
            initial_cwnd,
            state: Mutex::new(FxHashMap::default()),
        }
    }

    /// Hand out the next packet number for `dest`.
    pub fn next_pkt_num(&self, dest: Ipv4Addr) -> u32 {
        let mut state = self.state.lock().unwrap();
        let peer = state
            .entry(dest)
            .or_insert_with(|| PeerOutState::new(self.initial_cwnd));
        let pkt_num = peer.next_pkt_num;
        peer.next_pkt_num = peer.next_pkt_num.wrapping_add(1);
        pkt_num
    }

    /// Register `packet` as awaiting an ACK and start its retransmission
    /// timer. Returns the completion the caller can await: `true` once the ACK
    /// arrives, `false` after retries are exhausted or the peer is cleared.
    ///
    /// Fails with `CongestionWindowFull` while the packet number lies beyond
    /// the current window; callers retry after a short delay.
    ///
    /// Must be called at most once per packet.
    pub fn add_open_ack(
        self: &Arc<Self>,
        packet: &Packet,
        resend: ResendFn,
    ) -> Result<oneshot::Receiver<bool>, ProtocolError> {
        let dest = packet.header.dest;
        let pkt_num = packet.header.pkt_num;

        let mut state = self.state.lock().unwrap();
        let peer = state
            .entry(dest)
            .or_insert_with(|| PeerOutState::new(self.initial_cwnd));

        let pkt_num_wide = i64::from(pkt_num);
        if pkt_num_wide - peer.highest_acked_contiguous > peer.cwnd {
            return Err(ProtocolError::CongestionWindowFull {
                dest,
                pkt_num: pkt_num_wide,
                lower: peer.highest_acked_contiguous,
                upper: peer.highest_acked_contiguous + peer.cwnd,
            });
        }

        assert!(
            !peer.open_acks.contains_key(&pkt_num),
            "open ack for {dest} packet {pkt_num} already exists"
        );

        let (tx, rx) = oneshot::channel();
        let timer = tokio::spawn({
            let tracker = Arc::clone(self);
            let ack_timeout = self.ack_timeout;
            async move {
                loop {
                    tokio::time::sleep(ack_timeout).await;
                    match tracker.on_ack_timeout(dest, pkt_num) {
                        TimeoutVerdict::Gone => break,
                        TimeoutVerdict::Resend => resend().await,
                        TimeoutVerdict::FinalResend => {
                            resend().await;
                            break;
                        }
                    }
                }
            }
        });

        peer.open_acks.insert(
            pkt_num,
            OpenAck {
                timer: Some(timer),
                retries_remaining: self.retries_per_packet,
                waiter: Some(tx),
            },
        );

        Ok(rx)
    }

    /// Timer callback. Re-checks open-ack membership under the lock: the ack
    /// may have been removed between the timer firing and this running.
    fn on_ack_timeout(&self, dest: Ipv4Addr, pkt_num: u32) -> TimeoutVerdict {
        let mut state = self.state.lock().unwrap();
        let Some(peer) = state.get_mut(&dest) else {
            return TimeoutVerdict::Gone;
        };
        let Some(retries_remaining) = peer.open_acks.get(&pkt_num).map(|a| a.retries_remaining)
        else {
            return TimeoutVerdict::Gone;
        };

        debug!("ACK timeout for {} packet {}", dest, pkt_num);

        if retries_remaining == self.retries_per_packet {
            // only the first expiry of a packet shrinks the window, and only
            // outside the per-peer RTO cooldown (RFC 5681 §3.1)
            let cooled_down = peer
                .last_congestion_event
                .map(|at| at.elapsed() > self.ack_timeout)
                .unwrap_or(true);

            if cooled_down {
                let cwnd = peer.cwnd;
                peer.ssthresh = (cwnd / 2).max(2);
                peer.cwnd = (cwnd / 2).max(self.initial_cwnd);
                peer.avoidance_acc = 0;
                peer.last_congestion_event = Some(Instant::now());
                debug!(
                    "congestion event for {}: cwnd {} -> {}, ssthresh {}",
                    dest, cwnd, peer.cwnd, peer.ssthresh
                );
            } else {
                debug!("ignoring timeout for {} within RTO cooldown", dest);
            }
        }

        let ack = peer
            .open_acks
            .get_mut(&pkt_num)
            .expect("still present, lock is held");
        ack.retries_remaining -= 1;
        if ack.retries_remaining == 0 {
            warn!(
                "giving up on {} packet {} after exhausting retries",
                dest, pkt_num
            );
            // no timer abort: this very task is the timer and exits next
            Self::remove_locked(peer, pkt_num, false, false);
            TimeoutVerdict::FinalResend
        } else {
            TimeoutVerdict::Resend
        }
    }

    /// An ACK for `(source, pkt_num)` arrived: stop the timer, complete the
    /// waiter with `true`, advance the contiguous mark and grow the window.
    /// Silently returns if no such open ack exists.
    pub fn remove_open_ack(&self, dest: Ipv4Addr, pkt_num: u32) {
        let mut state = self.state.lock().unwrap();
        let Some(peer) = state.get_mut(&dest) else {
            return;
        };
        if !peer.open_acks.contains_key(&pkt_num) {
            trace!("no open ack for {} packet {}", dest, pkt_num);
            return;
        }
        Self::remove_locked(peer, pkt_num, true, true);
    }

    fn remove_locked(peer: &mut PeerOutState, pkt_num: u32, ack_received: bool, abort_timer: bool) {
        let mut ack = peer
            .open_acks
            .remove(&pkt_num)
            .expect("caller checked membership under the lock");

        if let Some(timer) = ack.timer.take() {
            if abort_timer {
                timer.abort();
            }
        }
        if let Some(waiter) = ack.waiter.take() {
            let _ = waiter.send(ack_received);
        }

        // advance past everything no longer open, up to the last number handed out
        let last_sent = i64::from(peer.next_pkt_num.wrapping_sub(1));
        loop {
            let next = peer.highest_acked_contiguous + 1;
            if next > last_sent {
                break;
            }
            if peer.open_acks.contains_key(&(next as u32)) {
                break;
            }
            peer.highest_acked_contiguous = next;
        }

        if ack_received {
            if peer.cwnd < peer.ssthresh {
                // slow start
                peer.cwnd += 1;
                peer.avoidance_acc = 0;
            } else {
                // congestion avoidance: one increment per full window of ACKs
                peer.avoidance_acc += 1;
                if peer.avoidance_acc >= peer.cwnd {
                    peer.cwnd += 1;
                    peer.avoidance_acc = 0;
                }
            }
        }
    }

    /// The destination became unreachable: drop all its state, stop every
    /// timer and complete every pending waiter with `false`.
    pub fn clear(&self, dest: Ipv4Addr) {
        let mut state = self.state.lock().unwrap();
        let Some(mut peer) = state.remove(&dest) else {
            return;
        };

        for (_, mut ack) in peer.open_acks.drain() {
            if let Some(timer) = ack.timer.take() {
                timer.abort();
            }
            if let Some(waiter) = ack.waiter.take() {
                let _ = waiter.send(false);
            }
        }
        debug!("cleared outgoing sequencing state for {}", dest);
    }

    /// Open packet numbers per destination, ascending, for introspection.
    pub fn get_open_acks(&self) -> Vec<(Ipv4Addr, Vec<u32>)> {
        let state = self.state.lock().unwrap();
        let mut result: Vec<(Ipv4Addr, Vec<u32>)> = state
            .iter()
            .filter(|(_, peer)| !peer.open_acks.is_empty())
            .map(|(addr, peer)| {
                let mut pkt_nums: Vec<u32> = peer.open_acks.keys().copied().collect();
                pkt_nums.sort_unstable();
                (*addr, pkt_nums)
            })
            .collect();
        result.sort_unstable_by_key(|(addr, _)| *addr);
        result
    }

    pub fn get_congestion_windows(&self) -> Vec<(Ipv4Addr, i64)> {
        let state = self.state.lock().unwrap();
        state.iter().map(|(addr, peer)| (*addr, peer.cwnd)).collect()
    }

    pub fn get_slow_start_thresholds(&self) -> Vec<(Ipv4Addr, i64)> {
        let state = self.state.lock().unwrap();
        state
            .iter()
            .map(|(addr, peer)| (*addr, peer.ssthresh))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{control_byte, MsgType, PacketHeader};
    use std::sync::atomic::{AtomicU32, Ordering};

    const DEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn packet(dest: Ipv4Addr, pkt_num: u32) -> Packet {
        Packet {
            header: PacketHeader {
                source: Ipv4Addr::new(10, 0, 0, 1),
                dest,
                control: control_byte(MsgType::ChatMessage, false, 0x2),
                ttl: 30,
                checksum: 0,
                pkt_num,
            },
            payload: vec![],
        }
    }

    fn noop_resend() -> ResendFn {
        Box::new(|| -> ResendFuture { Box::pin(async {}) })
    }

    fn counting_resend(counter: Arc<AtomicU32>) -> ResendFn {
        Box::new(move || -> ResendFuture {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn tracker(initial_cwnd: i64) -> Arc<OutgoingTracker> {
        Arc::new(OutgoingTracker::new(
            Duration::from_secs(5),
            2,
            initial_cwnd,
        ))
    }

    /// Allocate the next number and register the packet in one step.
    fn send_one(
        tracker: &Arc<OutgoingTracker>,
        dest: Ipv4Addr,
    ) -> Result<(u32, oneshot::Receiver<bool>), ProtocolError> {
        let pkt_num = tracker.next_pkt_num(dest);
        let rx = tracker.add_open_ack(&packet(dest, pkt_num), noop_resend())?;
        Ok((pkt_num, rx))
    }

    fn set_ssthresh(tracker: &OutgoingTracker, dest: Ipv4Addr, ssthresh: i64) {
        tracker
            .state
            .lock()
            .unwrap()
            .get_mut(&dest)
            .unwrap()
            .ssthresh = ssthresh;
    }

    fn congestion_state(tracker: &OutgoingTracker, dest: Ipv4Addr) -> (i64, i64, i64, i64) {
        let state = tracker.state.lock().unwrap();
        let peer = state.get(&dest).unwrap();
        (
            peer.cwnd,
            peer.ssthresh,
            peer.avoidance_acc,
            peer.highest_acked_contiguous,
        )
    }

    fn assert_window_invariant(tracker: &OutgoingTracker, dest: Ipv4Addr) {
        let state = tracker.state.lock().unwrap();
        let peer = state.get(&dest).unwrap();
        for pkt_num in peer.open_acks.keys() {
            let n = i64::from(*pkt_num);
            assert!(
                n > peer.highest_acked_contiguous
                    && n <= peer.highest_acked_contiguous + peer.cwnd,
                "open ack {} outside ({}, {}]",
                n,
                peer.highest_acked_contiguous,
                peer.highest_acked_contiguous + peer.cwnd
            );
        }
    }

    #[tokio::test]
    async fn test_packet_numbers_are_sequential_per_destination() {
        let tracker = tracker(2);
        let other = Ipv4Addr::new(10, 0, 0, 3);

        assert_eq!(tracker.next_pkt_num(DEST), 0);
        assert_eq!(tracker.next_pkt_num(DEST), 1);
        assert_eq!(tracker.next_pkt_num(other), 0);
        assert_eq!(tracker.next_pkt_num(DEST), 2);
    }

    #[tokio::test]
    async fn test_window_blocks_and_reopens() {
        let tracker = tracker(2);

        let (first, _rx_a) = send_one(&tracker, DEST).unwrap();
        let (_, _rx_b) = send_one(&tracker, DEST).unwrap();
        assert_window_invariant(&tracker, DEST);

        // window (-1, 1] is exhausted
        let blocked = tracker.next_pkt_num(DEST);
        assert!(matches!(
            tracker.add_open_ack(&packet(DEST, blocked), noop_resend()),
            Err(ProtocolError::CongestionWindowFull { .. })
        ));

        // far-ahead numbers are rejected regardless
        assert!(matches!(
            tracker.add_open_ack(&packet(DEST, 500), noop_resend()),
            Err(ProtocolError::CongestionWindowFull { .. })
        ));

        // an ACK opens the window again (and slow start widens it)
        tracker.remove_open_ack(DEST, first);
        tracker
            .add_open_ack(&packet(DEST, blocked), noop_resend())
            .unwrap();
        assert_window_invariant(&tracker, DEST);
    }

    #[tokio::test]
    async fn test_in_order_acks_advance_contiguous_mark() {
        let tracker = tracker(10);

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let (pkt_num, rx) = send_one(&tracker, DEST).unwrap();
            waiters.push((pkt_num, rx));
        }

        for (pkt_num, rx) in waiters {
            tracker.remove_open_ack(DEST, pkt_num);
            assert_eq!(rx.await, Ok(true));
            assert_window_invariant(&tracker, DEST);
        }

        let (_, _, _, highest) = congestion_state(&tracker, DEST);
        assert_eq!(highest, 3);
        assert!(tracker.get_open_acks().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_acks_advance_only_contiguously() {
        let tracker = tracker(10);

        for _ in 0..3 {
            send_one(&tracker, DEST).unwrap();
        }

        tracker.remove_open_ack(DEST, 2);
        let (_, _, _, highest) = congestion_state(&tracker, DEST);
        assert_eq!(highest, -1, "0 and 1 are still open");

        tracker.remove_open_ack(DEST, 0);
        let (_, _, _, highest) = congestion_state(&tracker, DEST);
        assert_eq!(highest, 0);

        tracker.remove_open_ack(DEST, 1);
        let (_, _, _, highest) = congestion_state(&tracker, DEST);
        assert_eq!(highest, 2, "ACK of 1 pulls the already-acked 2 along");
    }

    #[tokio::test]
    async fn test_congestion_avoidance_counts_full_windows() {
        let tracker = tracker(2);

        // cwnd=2, ssthresh=1: in congestion avoidance from the start
        let (p0, _rx0) = send_one(&tracker, DEST).unwrap();
        set_ssthresh(&tracker, DEST, 1);
        let (p1, _rx1) = send_one(&tracker, DEST).unwrap();

        tracker.remove_open_ack(DEST, p0);
        tracker.remove_open_ack(DEST, p1);
        let (cwnd, _, acc, _) = congestion_state(&tracker, DEST);
        assert_eq!((cwnd, acc), (3, 0), "two ACKs fill the window of 2");

        let (p2, _rx2) = send_one(&tracker, DEST).unwrap();
        let (p3, _rx3) = send_one(&tracker, DEST).unwrap();
        tracker.remove_open_ack(DEST, p2);
        tracker.remove_open_ack(DEST, p3);
        let (cwnd, _, acc, _) = congestion_state(&tracker, DEST);
        assert_eq!((cwnd, acc), (3, 2), "two of three ACKs accumulated");

        let (p4, _rx4) = send_one(&tracker, DEST).unwrap();
        tracker.remove_open_ack(DEST, p4);
        let (cwnd, _, acc, _) = congestion_state(&tracker, DEST);
        assert_eq!((cwnd, acc), (4, 0));
    }

    #[tokio::test]
    async fn test_slow_start_grows_per_ack() {
        let tracker = tracker(2);

        let (p0, _rx0) = send_one(&tracker, DEST).unwrap();
        let (p1, _rx1) = send_one(&tracker, DEST).unwrap();

        tracker.remove_open_ack(DEST, p0);
        tracker.remove_open_ack(DEST, p1);

        let (cwnd, ssthresh, _, _) = congestion_state(&tracker, DEST);
        assert_eq!(cwnd, 4, "below ssthresh every ACK adds one");
        assert_eq!(ssthresh, i64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_decreases_window_once_per_cooldown() {
        let tracker = tracker(4);
        let resends = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let pkt_num = tracker.next_pkt_num(DEST);
            tracker
                .add_open_ack(&packet(DEST, pkt_num), counting_resend(resends.clone()))
                .unwrap();
        }

        // first expiry of all four packets; only one congestion decrease
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        tokio::task::yield_now().await;

        let (cwnd, ssthresh, _, _) = congestion_state(&tracker, DEST);
        assert_eq!(cwnd, 2, "max(4/2, initial 2)");
        assert_eq!(ssthresh, 2, "max(4/2, 2)");
        assert!(cwnd >= 2 && ssthresh >= 2);
        assert_eq!(resends.load(Ordering::SeqCst), 4);
        assert_window_invariant(&tracker, DEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_completes_waiter_with_false() {
        let tracker = tracker(4);
        let resends = Arc::new(AtomicU32::new(0));

        let pkt_num = tracker.next_pkt_num(DEST);
        let rx = tracker
            .add_open_ack(&packet(DEST, pkt_num), counting_resend(resends.clone()))
            .unwrap();

        // two expiries at 5s each exhaust retries_per_packet = 2
        tokio::time::sleep(Duration::from_millis(10_200)).await;
        tokio::task::yield_now().await;

        assert_eq!(rx.await, Ok(false));
        assert_eq!(resends.load(Ordering::SeqCst), 2);
        assert!(tracker.get_open_acks().is_empty());

        // the dead packet no longer blocks the window
        let (_, _, _, highest) = congestion_state(&tracker, DEST);
        assert_eq!(highest, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_first_retry_stops_timer() {
        let tracker = tracker(4);
        let resends = Arc::new(AtomicU32::new(0));

        let pkt_num = tracker.next_pkt_num(DEST);
        let rx = tracker
            .add_open_ack(&packet(DEST, pkt_num), counting_resend(resends.clone()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        tokio::task::yield_now().await;
        assert_eq!(resends.load(Ordering::SeqCst), 1);

        tracker.remove_open_ack(DEST, pkt_num);
        assert_eq!(rx.await, Ok(true));

        // no further resend after the ACK
        tokio::time::sleep(Duration::from_millis(11_000)).await;
        tokio::task::yield_now().await;
        assert_eq!(resends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_completes_all_waiters_with_false() {
        let tracker = tracker(10);

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let (_, rx) = send_one(&tracker, DEST).unwrap();
            waiters.push(rx);
        }

        tracker.clear(DEST);

        for rx in waiters {
            assert_eq!(rx.await, Ok(false));
        }
        assert!(tracker.get_open_acks().is_empty());
        assert_eq!(tracker.next_pkt_num(DEST), 0, "numbering restarts after clear");
    }

    #[tokio::test]
    async fn test_remove_unknown_ack_is_a_noop() {
        let tracker = tracker(2);
        tracker.remove_open_ack(DEST, 17);
        tracker.next_pkt_num(DEST);
        tracker.remove_open_ack(DEST, 17);
    }

    #[tokio::test]
    #[should_panic]
    async fn test_double_add_panics() {
        let tracker = tracker(4);
        let pkt_num = tracker.next_pkt_num(DEST);
        tracker
            .add_open_ack(&packet(DEST, pkt_num), noop_resend())
            .unwrap();
        let _ = tracker.add_open_ack(&packet(DEST, pkt_num), noop_resend());
    }
}
