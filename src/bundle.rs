use bytes::{BufMut, BytesMut};

/// Accumulates serialized messages into packet-sized bodies.
///
/// Messages are written back to back; a write that does not fit the current body spills into
///  a fresh one, so a single big message (or a run of small ones) can occupy any number of
///  bodies. One resulting body becomes one packet on the wire; more than one becomes a
///  fragment chain. Packet headers are *not* part of the bodies - the channel prepends them
///  per packet when flushing.
pub struct Bundle {
    max_body_len: usize,
    full_bodies: Vec<BytesMut>,
    current: BytesMut,
}

impl Bundle {
    pub fn new(max_body_len: usize) -> Bundle {
        assert!(max_body_len > 0);
        Bundle {
            max_body_len,
            full_bodies: Vec::new(),
            current: BytesMut::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.full_bodies.is_empty() && self.current.is_empty()
    }

    pub fn body_count(&self) -> usize {
        self.full_bodies.len() + if self.current.is_empty() { 0 } else { 1 }
    }

    /// total buffered message bytes across all bodies
    pub fn len(&self) -> usize {
        self.full_bodies.iter().map(|b| b.len()).sum::<usize>() + self.current.len()
    }

    /// room left in the body the next write goes to
    pub fn current_body_remaining(&self) -> usize {
        if self.current.len() == self.max_body_len {
            self.max_body_len
        }
        else {
            self.max_body_len - self.current.len()
        }
    }

    fn spill_if_full(&mut self) {
        if self.current.len() == self.max_body_len {
            let full = std::mem::take(&mut self.current);
            self.full_bodies.push(full);
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.spill_if_full();
        self.current.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_slice(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            self.spill_if_full();
            let fits = (self.max_body_len - self.current.len()).min(data.len());
            self.current.put_slice(&data[..fits]);
            data = &data[fits..];
        }
    }

    /// Close the current body even if there is room left. The next write starts a new body,
    ///  and with it a new packet - required after a tail-length message, which has to be the
    ///  last one in its packet.
    pub fn seal_body(&mut self) {
        if !self.current.is_empty() {
            let body = std::mem::take(&mut self.current);
            self.full_bodies.push(body);
        }
    }

    /// drain all buffered bodies, leaving the bundle empty for reuse
    pub fn take_bodies(&mut self) -> Vec<BytesMut> {
        self.seal_body();
        std::mem::take(&mut self.full_bodies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_empty() {
        let mut bundle = Bundle::new(8);
        assert!(bundle.is_empty());
        assert_eq!(bundle.body_count(), 0);
        assert!(bundle.take_bodies().is_empty());
    }

    #[rstest]
    fn test_small_messages_share_a_body() {
        let mut bundle = Bundle::new(8);
        bundle.put_slice(&[1, 2, 3]);
        bundle.put_slice(&[4, 5]);

        let bodies = bundle.take_bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].to_vec(), vec![1, 2, 3, 4, 5]);
        assert!(bundle.is_empty());
    }

    #[rstest]
    fn test_write_spills_across_bodies() {
        let mut bundle = Bundle::new(4);
        bundle.put_u8(0xaa);
        bundle.put_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(bundle.len(), 7);
        assert_eq!(bundle.body_count(), 2);

        let bodies = bundle.take_bodies();
        assert_eq!(bodies[0].to_vec(), vec![0xaa, 1, 2, 3]);
        assert_eq!(bodies[1].to_vec(), vec![4, 5, 6]);
    }

    #[rstest]
    fn test_multibyte_put_crosses_boundary() {
        let mut bundle = Bundle::new(4);
        bundle.put_u16(0x0102);
        bundle.put_u32(0xa1b2c3d4);

        let bodies = bundle.take_bodies();
        assert_eq!(bodies[0].to_vec(), vec![1, 2, 0xa1, 0xb2]);
        assert_eq!(bodies[1].to_vec(), vec![0xc3, 0xd4]);
    }

    #[rstest]
    fn test_seal_body_forces_new_body() {
        let mut bundle = Bundle::new(8);
        bundle.put_slice(&[1, 2]);
        bundle.seal_body();
        bundle.put_slice(&[3]);

        let bodies = bundle.take_bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0].to_vec(), vec![1, 2]);
        assert_eq!(bodies[1].to_vec(), vec![3]);
    }

    #[rstest]
    fn test_exactly_full_body_is_not_followed_by_an_empty_one() {
        let mut bundle = Bundle::new(4);
        bundle.put_slice(&[1, 2, 3, 4]);
        assert_eq!(bundle.body_count(), 1);
        let bodies = bundle.take_bodies();
        assert_eq!(bodies.len(), 1);
    }
}
