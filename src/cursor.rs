use anyhow::bail;

/// A read cursor over a chain of non-contiguous buffers, for decoding messages that straddle
///  fragment boundaries without copying the fragments into one contiguous allocation first.
///
/// Multi-byte integers are big endian, matching the rest of the wire format.
pub struct ChainCursor<'a, B: AsRef<[u8]>> {
    chain: &'a [B],
    /// index of the buffer the cursor is currently in
    idx: usize,
    /// offset into that buffer
    offs: usize,
}

impl<'a, B: AsRef<[u8]>> ChainCursor<'a, B> {
    pub fn new(chain: &'a [B]) -> ChainCursor<'a, B> {
        ChainCursor { chain, idx: 0, offs: 0 }
    }

    pub fn remaining(&self) -> usize {
        if self.idx >= self.chain.len() {
            return 0;
        }
        let in_current = self.chain[self.idx].as_ref().len() - self.offs;
        in_current + self.chain[self.idx + 1..].iter()
            .map(|b| b.as_ref().len())
            .sum::<usize>()
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    fn next_byte(&mut self) -> Option<u8> {
        loop {
            let buf = self.chain.get(self.idx)?.as_ref();
            if self.offs < buf.len() {
                let byte = buf[self.offs];
                self.offs += 1;
                return Some(byte);
            }
            self.idx += 1;
            self.offs = 0;
        }
    }

    pub fn try_get_u8(&mut self) -> anyhow::Result<u8> {
        match self.next_byte() {
            Some(byte) => Ok(byte),
            None => bail!("message truncated: buffer chain exhausted"),
        }
    }

    pub fn try_get_u16(&mut self) -> anyhow::Result<u16> {
        let hi = self.try_get_u8()?;
        let lo = self.try_get_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    pub fn try_get_u32(&mut self) -> anyhow::Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes)?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_exact(&mut self, target: &mut [u8]) -> anyhow::Result<()> {
        for slot in target.iter_mut() {
            *slot = self.try_get_u8()?;
        }
        Ok(())
    }

    /// read `len` bytes into a fresh buffer, copying across buffer boundaries as needed
    pub fn read_vec(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        if len > self.remaining() {
            bail!("message truncated: {} bytes required, {} available", len, self.remaining());
        }

        let mut result = Vec::with_capacity(len);
        while result.len() < len {
            let buf = self.chain[self.idx].as_ref();
            let available = &buf[self.offs..];
            let take = available.len().min(len - result.len());
            result.extend_from_slice(&available[..take]);
            self.offs += take;
            if self.offs == buf.len() {
                self.idx += 1;
                self.offs = 0;
            }
        }
        Ok(result)
    }

    pub fn advance(&mut self, n: usize) -> anyhow::Result<()> {
        let mut remaining = n;
        while remaining > 0 {
            let Some(buf) = self.chain.get(self.idx) else {
                bail!("cannot advance {} bytes: buffer chain exhausted", n);
            };
            let buf_len = buf.as_ref().len();
            let take = (buf_len - self.offs).min(remaining);
            self.offs += take;
            remaining -= take;
            if self.offs == buf_len && remaining > 0 {
                self.idx += 1;
                self.offs = 0;
            }
        }
        Ok(())
    }
}
