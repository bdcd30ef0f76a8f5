use crate::seq::SeqNum;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PacketFlags: u8 {
        const RELIABLE        = 0x01;
        const FRAGMENT        = 0x02;
        const CREATE_CHANNEL  = 0x04;
        const INDEXED_CHANNEL = 0x08;
        const CUMULATIVE_ACK  = 0x10;
        const SELECTIVE_ACKS  = 0x20;
    }
}

/// an indexed (secondary) channel is addressed by a small id and carries a version that lets
///  the receiver detect a peer restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedChannelId {
    pub id: u16,
    pub version: u32,
}

/// A packet that is part of a fragmented message names the full chain it belongs to, so a
///  receiver can tell when the chain is complete and when parts of it are lost for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentChain {
    pub begin: SeqNum,
    pub end: SeqNum,
}

/// The header preceding every packet's message data.
///
/// ```ascii
/// +--------+-------+-----------------+----------------+---------+------------------+
/// | seq    | flags | channel id +    | fragment chain | cum ack | sack count +     |
/// | u32 BE | u8    | version (opt)   | begin/end (opt)| (opt)   | sack seqs (opt)  |
/// +--------+-------+-----------------+----------------+---------+------------------+
/// ```
///
/// All optional parts are present iff the corresponding flag bit is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub seq: SeqNum,
    pub reliable: bool,
    pub create_channel: bool,
    pub indexed: Option<IndexedChannelId>,
    pub fragment: Option<FragmentChain>,
    pub cumulative_ack: Option<SeqNum>,
    pub selective_acks: Vec<SeqNum>,
}

/// upper bound on the selective ack list - anything bigger than a receive window's worth of
///  holes is a malformed packet
const MAX_SELECTIVE_ACKS: u64 = 4096;

impl PacketHeader {
    pub fn new(seq: SeqNum, reliable: bool) -> PacketHeader {
        PacketHeader {
            seq,
            reliable,
            create_channel: false,
            indexed: None,
            fragment: None,
            cumulative_ack: None,
            selective_acks: Vec::new(),
        }
    }

    fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::RELIABLE, self.reliable);
        flags.set(PacketFlags::CREATE_CHANNEL, self.create_channel);
        flags.set(PacketFlags::INDEXED_CHANNEL, self.indexed.is_some());
        flags.set(PacketFlags::FRAGMENT, self.fragment.is_some());
        flags.set(PacketFlags::CUMULATIVE_ACK, self.cumulative_ack.is_some());
        flags.set(PacketFlags::SELECTIVE_ACKS, !self.selective_acks.is_empty());
        flags
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq.to_raw());
        buf.put_u8(self.flags().bits());

        if let Some(indexed) = self.indexed {
            buf.put_u16(indexed.id);
            buf.put_u32(indexed.version);
        }
        if let Some(fragment) = self.fragment {
            buf.put_u32(fragment.begin.to_raw());
            buf.put_u32(fragment.end.to_raw());
        }
        if let Some(ack) = self.cumulative_ack {
            buf.put_u32(ack.to_raw());
        }
        if !self.selective_acks.is_empty() {
            buf.put_u64_varint(self.selective_acks.len() as u64);
            for &sack in &self.selective_acks {
                buf.put_u32(sack.to_raw());
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let seq = SeqNum::from_raw(buf.try_get_u32()?);
        let raw_flags = buf.try_get_u8()?;
        let Some(flags) = PacketFlags::from_bits(raw_flags) else {
            bail!("packet header with unknown flag bits: {:#04x}", raw_flags);
        };

        let indexed = if flags.contains(PacketFlags::INDEXED_CHANNEL) {
            Some(IndexedChannelId {
                id: buf.try_get_u16()?,
                version: buf.try_get_u32()?,
            })
        }
        else {
            None
        };

        let fragment = if flags.contains(PacketFlags::FRAGMENT) {
            Some(FragmentChain {
                begin: SeqNum::from_raw(buf.try_get_u32()?),
                end: SeqNum::from_raw(buf.try_get_u32()?),
            })
        }
        else {
            None
        };

        let cumulative_ack = if flags.contains(PacketFlags::CUMULATIVE_ACK) {
            Some(SeqNum::from_raw(buf.try_get_u32()?))
        }
        else {
            None
        };

        let selective_acks = if flags.contains(PacketFlags::SELECTIVE_ACKS) {
            let count = buf.try_get_u64_varint()?;
            if count == 0 || count > MAX_SELECTIVE_ACKS {
                bail!("packet header with implausible selective ack count {}", count);
            }
            let mut sacks = Vec::with_capacity(count as usize);
            for _ in 0..count {
                sacks.push(SeqNum::from_raw(buf.try_get_u32()?));
            }
            sacks
        }
        else {
            Vec::new()
        };

        Ok(PacketHeader {
            seq,
            reliable: flags.contains(PacketFlags::RELIABLE),
            create_channel: flags.contains(PacketFlags::CREATE_CHANNEL),
            indexed,
            fragment,
            cumulative_ack,
            selective_acks,
        })
    }

    pub fn serialized_len(&self) -> usize {
        let mut len = 4 + 1;
        if self.indexed.is_some() {
            len += 2 + 4;
        }
        if self.fragment.is_some() {
            len += 4 + 4;
        }
        if self.cumulative_ack.is_some() {
            len += 4;
        }
        if !self.selective_acks.is_empty() {
            let mut scratch = BytesMut::new();
            scratch.put_u64_varint(self.selective_acks.len() as u64);
            len += scratch.len() + 4 * self.selective_acks.len();
        }
        len
    }
}
