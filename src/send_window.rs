use crate::seq::SeqNum;
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::time::Instant;

/// one sent, not yet fully acknowledged reliable packet, kept verbatim for resending
pub struct SendWindowSlot {
    pub seq: SeqNum,
    pub packet: Bytes,
    pub sent_at: Instant,
    pub was_resent: bool,
    pub acked: bool,
}

/// What an incoming selective ack meant for the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// first ack for this packet
    Fresh {
        was_resent: bool,
        sent_at: Instant,
        /// older packets are still outstanding - i.e. they were likely lost
        hole_behind: bool,
    },
    /// acked before, but not yet retired by a cumulative ack
    AlreadyAcked,
    /// at or below the retired prefix - nothing left to do
    Retired,
    /// acks a sequence number we never sent
    OutOfRange,
}

/// The send side of a reliable channel's packet bookkeeping: sequence number assignment and
///  the buffer of sent packets awaiting acknowledgement.
///
/// Slots are stored contiguously by sequence number. A packet acked out of order is only
///  flagged; it leaves the window when the acked prefix reaches it, so the front slot is
///  always the oldest unacknowledged packet.
pub struct SendWindow {
    next_to_send: SeqNum,
    slots: VecDeque<SendWindowSlot>,
    window_size: usize,
}

impl SendWindow {
    pub fn new(window_size: usize) -> SendWindow {
        assert!(window_size > 0);
        SendWindow {
            next_to_send: SeqNum::ZERO,
            slots: VecDeque::new(),
            window_size,
        }
    }

    /// total buffered packets, acked interior ones included
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// number of slots beyond the nominal window size
    pub fn overflow(&self) -> usize {
        self.slots.len().saturating_sub(self.window_size)
    }

    pub fn next_to_send(&self) -> SeqNum {
        self.next_to_send
    }

    /// `true` iff `seq` was assigned to a packet at some point - i.e. it is a plausible ack
    pub fn was_sent(&self, seq: SeqNum) -> bool {
        seq.diff(self.next_to_send) < 0
    }

    /// assign the next sequence number; the packet built with it must be `record`ed
    pub fn next_seq(&mut self) -> SeqNum {
        let seq = self.next_to_send;
        self.next_to_send = self.next_to_send.next();
        seq
    }

    pub fn record(&mut self, seq: SeqNum, packet: Bytes, now: Instant) {
        debug_assert!(
            self.slots.back().map(|slot| slot.seq.next() == seq).unwrap_or(true),
            "packets must be recorded in sequence order without gaps",
        );
        self.slots.push_back(SendWindowSlot {
            seq,
            packet,
            sent_at: now,
            was_resent: false,
            acked: false,
        });
    }

    pub fn oldest_unacked(&self) -> Option<SeqNum> {
        self.slots.front().map(|slot| slot.seq)
    }

    /// oldest outstanding slot, for resending
    pub fn oldest_slot_mut(&mut self) -> Option<&mut SendWindowSlot> {
        self.slots.front_mut()
    }

    /// Apply a selective ack for a single packet.
    pub fn mark_acked(&mut self, seq: SeqNum) -> AckOutcome {
        let Some(front_seq) = self.oldest_unacked() else {
            return AckOutcome::Retired;
        };

        let idx = seq.diff(front_seq);
        if idx < 0 {
            return AckOutcome::Retired;
        }
        let idx = idx as usize;
        if idx >= self.slots.len() {
            return AckOutcome::OutOfRange;
        }

        let slot = &mut self.slots[idx];
        if slot.acked {
            return AckOutcome::AlreadyAcked;
        }
        slot.acked = true;
        let outcome = AckOutcome::Fresh {
            was_resent: slot.was_resent,
            sent_at: slot.sent_at,
            hole_behind: idx > 0,
        };

        // the acked prefix is done with - unlike acked interior slots, which must wait for
        //  the packets in front of them
        while self.slots.front().map(|slot| slot.acked).unwrap_or(false) {
            self.slots.pop_front();
        }
        outcome
    }

    /// Apply a cumulative ack: everything up to and including `cum` leaves the window. The
    ///  retired slots are returned so the caller can harvest RTT samples from them.
    pub fn retire_through(&mut self, cum: SeqNum) -> Vec<SendWindowSlot> {
        let mut retired = Vec::new();
        while let Some(front) = self.slots.front() {
            if front.seq.is_after(cum) {
                break;
            }
            if let Some(slot) = self.slots.pop_front() {
                retired.push(slot);
            }
        }
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn window_with_sent(count: u32) -> (SendWindow, Instant) {
        let now = Instant::now();
        let mut window = SendWindow::new(32);
        for _ in 0..count {
            let seq = window.next_seq();
            window.record(seq, Bytes::from_static(b"pkt"), now);
        }
        (window, now)
    }

    #[rstest]
    fn test_selective_acks_with_hole() {
        let (mut window, now) = window_with_sent(6);

        assert_eq!(window.mark_acked(SeqNum::from_raw(0)),
            AckOutcome::Fresh { was_resent: false, sent_at: now, hole_behind: false });
        assert_eq!(window.mark_acked(SeqNum::from_raw(1)),
            AckOutcome::Fresh { was_resent: false, sent_at: now, hole_behind: false });
        assert_eq!(window.mark_acked(SeqNum::from_raw(3)),
            AckOutcome::Fresh { was_resent: false, sent_at: now, hole_behind: true });

        // 2 is the hole: still the front, with 3 flagged but stuck behind it
        assert_eq!(window.oldest_unacked(), Some(SeqNum::from_raw(2)));
        assert_eq!(window.len(), 4);

        // a cumulative ack through 3 releases both the hole and the flagged slot
        assert_eq!(window.retire_through(SeqNum::from_raw(3)).len(), 2);
        assert_eq!(window.oldest_unacked(), Some(SeqNum::from_raw(4)));
    }

    #[rstest]
    fn test_ack_front_pops_through_acked_interior() {
        let (mut window, _) = window_with_sent(3);

        window.mark_acked(SeqNum::from_raw(1));
        assert_eq!(window.len(), 3);

        // acking the front releases it and the already-acked slot behind it
        window.mark_acked(SeqNum::from_raw(0));
        assert_eq!(window.oldest_unacked(), Some(SeqNum::from_raw(2)));
        assert_eq!(window.len(), 1);
    }

    #[rstest]
    fn test_duplicate_and_stale_acks() {
        let (mut window, _) = window_with_sent(4);

        window.mark_acked(SeqNum::from_raw(2));
        assert_eq!(window.mark_acked(SeqNum::from_raw(2)), AckOutcome::AlreadyAcked);

        window.mark_acked(SeqNum::from_raw(0));
        assert_eq!(window.mark_acked(SeqNum::from_raw(0)), AckOutcome::Retired);

        assert_eq!(window.mark_acked(SeqNum::from_raw(17)), AckOutcome::OutOfRange);
    }

    #[rstest]
    fn test_was_sent() {
        let (window, _) = window_with_sent(3);
        assert!(window.was_sent(SeqNum::from_raw(0)));
        assert!(window.was_sent(SeqNum::from_raw(2)));
        assert!(!window.was_sent(SeqNum::from_raw(3)));
    }

    #[rstest]
    fn test_retire_through_ignores_future_interior() {
        let (mut window, _) = window_with_sent(5);
        window.mark_acked(SeqNum::from_raw(4));
        assert_eq!(window.len(), 5);

        assert_eq!(window.retire_through(SeqNum::from_raw(1)).len(), 2);
        assert_eq!(window.oldest_unacked(), Some(SeqNum::from_raw(2)));
        // slot 4 stays flagged but buffered
        assert_eq!(window.len(), 3);
    }

    #[rstest]
    fn test_overflow_accounting() {
        let now = Instant::now();
        let mut window = SendWindow::new(2);
        for _ in 0..3 {
            let seq = window.next_seq();
            window.record(seq, Bytes::new(), now);
        }
        assert_eq!(window.overflow(), 1);
        window.retire_through(SeqNum::from_raw(0));
        assert_eq!(window.overflow(), 0);
    }

    #[rstest]
    fn test_next_seq_is_sequential() {
        let mut window = SendWindow::new(4);
        assert_eq!(window.next_seq(), SeqNum::ZERO);
        assert_eq!(window.next_seq(), SeqNum::from_raw(1));
        assert_eq!(window.next_to_send(), SeqNum::from_raw(2));
    }
}
