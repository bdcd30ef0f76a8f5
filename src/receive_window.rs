use crate::seq::SeqNum;
use std::collections::VecDeque;

/// where an incoming packet's sequence number falls relative to the receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveClass {
    /// exactly the next expected packet - deliverable immediately
    NextInWindow,
    /// ahead of the next expected packet but within the window - buffer it
    BufferedInWindow,
    /// already delivered or already buffered
    Duplicate,
    /// too far ahead to buffer
    OutOfWindow,
}

/// The receive side of a reliable channel's packet bookkeeping: buffers packets that arrive
///  ahead of a gap and releases them in sequence order once the gap fills.
///
/// Slot `i` of the buffer corresponds to sequence number `next_expected + i`; slot 0 is only
///  ever occupied transiently, between an insert and the drain that follows it.
pub struct ReceiveWindow<T> {
    next_expected: SeqNum,
    buffered: VecDeque<Option<T>>,
    window_size: usize,
    delivered_any: bool,
}

impl<T> ReceiveWindow<T> {
    pub fn new(window_size: usize) -> ReceiveWindow<T> {
        assert!(window_size > 0);
        ReceiveWindow {
            next_expected: SeqNum::ZERO,
            buffered: VecDeque::new(),
            window_size,
            delivered_any: false,
        }
    }

    pub fn next_expected(&self) -> SeqNum {
        self.next_expected
    }

    pub fn classify(&self, seq: SeqNum) -> ReceiveClass {
        let offset = seq.diff(self.next_expected);
        if offset == 0 {
            return ReceiveClass::NextInWindow;
        }
        if offset < 0 {
            return ReceiveClass::Duplicate;
        }
        let offset = offset as usize;
        if offset >= self.window_size {
            return ReceiveClass::OutOfWindow;
        }
        match self.buffered.get(offset) {
            Some(Some(_)) => ReceiveClass::Duplicate,
            _ => ReceiveClass::BufferedInWindow,
        }
    }

    /// Store a packet classified `NextInWindow` or `BufferedInWindow`. Duplicate and
    ///  out-of-window packets must not reach this.
    pub fn insert(&mut self, seq: SeqNum, value: T) {
        let offset = seq.diff(self.next_expected);
        debug_assert!(offset >= 0 && (offset as usize) < self.window_size);
        let offset = offset as usize;

        while self.buffered.len() <= offset {
            self.buffered.push_back(None);
        }
        debug_assert!(self.buffered[offset].is_none(), "duplicate insert");
        self.buffered[offset] = Some(value);
    }

    /// Take the next in-sequence packet if it has arrived, advancing the window. Drain in a
    ///  loop: filling one gap can release a whole run of buffered packets.
    pub fn take_next_ready(&mut self) -> Option<T> {
        match self.buffered.front_mut() {
            Some(slot @ Some(_)) => {
                let value = slot.take();
                self.buffered.pop_front();
                self.next_expected = self.next_expected.next();
                self.delivered_any = true;
                value
            }
            _ => None,
        }
    }

    /// highest sequence number below which everything has been delivered, i.e. the value to
    ///  put in outgoing cumulative acks; `None` until the first delivery
    pub fn cumulative_ack(&self) -> Option<SeqNum> {
        self.delivered_any
            .then(|| SeqNum::from_raw(self.next_expected.to_raw().wrapping_sub(1)))
    }

    /// sequence numbers received ahead of the cumulative point, for outgoing selective acks
    pub fn buffered_seqs(&self) -> Vec<SeqNum> {
        self.buffered.iter().enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(offset, _)| self.next_expected.plus(offset as u32))
            .collect()
    }

    /// forget everything, e.g. when the peer restarted with a new channel version
    pub fn reset(&mut self) {
        self.next_expected = SeqNum::ZERO;
        self.buffered.clear();
        self.delivered_any = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seq(n: u32) -> SeqNum {
        SeqNum::from_raw(n)
    }

    #[rstest]
    fn test_in_order_delivery() {
        let mut window: ReceiveWindow<&str> = ReceiveWindow::new(8);
        assert_eq!(window.classify(seq(0)), ReceiveClass::NextInWindow);

        window.insert(seq(0), "a");
        assert_eq!(window.take_next_ready(), Some("a"));
        assert_eq!(window.take_next_ready(), None);
        assert_eq!(window.next_expected(), seq(1));
        assert_eq!(window.cumulative_ack(), Some(seq(0)));
    }

    #[rstest]
    fn test_gap_blocks_delivery_until_filled() {
        let mut window: ReceiveWindow<u32> = ReceiveWindow::new(8);

        assert_eq!(window.classify(seq(2)), ReceiveClass::BufferedInWindow);
        window.insert(seq(2), 2);
        window.insert(seq(1), 1);
        assert_eq!(window.take_next_ready(), None, "0 is still missing");
        assert_eq!(window.buffered_seqs(), vec![seq(1), seq(2)]);

        window.insert(seq(0), 0);
        assert_eq!(window.take_next_ready(), Some(0));
        assert_eq!(window.take_next_ready(), Some(1));
        assert_eq!(window.take_next_ready(), Some(2));
        assert_eq!(window.take_next_ready(), None);
        assert_eq!(window.cumulative_ack(), Some(seq(2)));
    }

    #[rstest]
    fn test_duplicate_classification() {
        let mut window: ReceiveWindow<()> = ReceiveWindow::new(8);
        window.insert(seq(0), ());
        window.take_next_ready();
        window.insert(seq(3), ());

        // already delivered
        assert_eq!(window.classify(seq(0)), ReceiveClass::Duplicate);
        // already buffered
        assert_eq!(window.classify(seq(3)), ReceiveClass::Duplicate);
        // gap, still wanted
        assert_eq!(window.classify(seq(2)), ReceiveClass::BufferedInWindow);
    }

    #[rstest]
    fn test_out_of_window() {
        let window: ReceiveWindow<()> = ReceiveWindow::new(4);
        assert_eq!(window.classify(seq(3)), ReceiveClass::BufferedInWindow);
        assert_eq!(window.classify(seq(4)), ReceiveClass::OutOfWindow);
    }

    #[rstest]
    fn test_no_cumulative_ack_before_first_delivery() {
        let mut window: ReceiveWindow<()> = ReceiveWindow::new(8);
        assert_eq!(window.cumulative_ack(), None);
        window.insert(seq(1), ());
        assert_eq!(window.cumulative_ack(), None, "buffering is not delivery");
    }

    #[rstest]
    fn test_reset() {
        let mut window: ReceiveWindow<()> = ReceiveWindow::new(8);
        window.insert(seq(0), ());
        window.take_next_ready();
        window.insert(seq(2), ());

        window.reset();
        assert_eq!(window.next_expected(), seq(0));
        assert_eq!(window.cumulative_ack(), None);
        assert!(window.buffered_seqs().is_empty());
    }

    #[rstest]
    fn test_window_wraps_with_sequence_numbers() {
        let mut window: ReceiveWindow<u32> = ReceiveWindow::new(8);
        // march the window close to the wrap point
        window.next_expected = seq(u32::MAX);
        window.delivered_any = true;

        assert_eq!(window.classify(seq(0)), ReceiveClass::BufferedInWindow);
        window.insert(seq(u32::MAX), 1);
        window.insert(seq(0), 2);
        assert_eq!(window.take_next_ready(), Some(1));
        assert_eq!(window.take_next_ready(), Some(2));
        assert_eq!(window.cumulative_ack(), Some(seq(0)));
        assert_eq!(window.next_expected(), seq(1));
    }
}
