use crate::reactor::Timers;
use anyhow::bail;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// message id reserved for replies to requests; implicitly registered, always tail-length
pub const REPLY_MESSAGE_ID: u8 = 0xff;

/// How a message's payload length is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthStyle {
    /// every message with this id has exactly this payload length; no length field on the wire
    Fixed(usize),
    /// an explicit big-endian length field of 1..=4 bytes follows the message id
    Variable(u8),
    /// the message extends to the end of its packet; no length field, but the message must be
    ///  the last one in its packet
    Tail,
}

impl LengthStyle {
    /// number of bytes the length field occupies after the message id
    pub fn field_len(&self) -> usize {
        match self {
            LengthStyle::Fixed(_) => 0,
            LengthStyle::Variable(width) => *width as usize,
            LengthStyle::Tail => 0,
        }
    }

    /// The biggest length value a `Variable` field can hold directly. The all-ones bit
    ///  pattern is reserved as the escape sentinel, so e.g. a one-byte field tops out at 254.
    pub fn max_plain_len(&self) -> Option<usize> {
        match self {
            LengthStyle::Variable(width) => {
                let all_ones = (1u64 << (8 * *width as u64)) - 1;
                Some((all_ones - 1) as usize)
            }
            _ => None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let LengthStyle::Variable(width) = self {
            if !(1..=4).contains(width) {
                bail!("variable length field must be 1 to 4 bytes wide, got {}", width);
            }
        }
        Ok(())
    }
}

/// Where a dispatched message came from, handed to its handler alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSource {
    pub peer_addr: SocketAddr,
    /// `None` for the peer's anonymous channel
    pub channel_index: Option<u16>,
    /// set iff the message is a request the handler is expected to answer
    pub reply_id: Option<u32>,
}

/// Application callback for one registered message id. Handlers are called on the
///  dispatcher's task outside all channel locks, so they are free to send messages of
///  their own through the timers they are handed.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, timers: &mut Timers, source: &MessageSource, payload: &[u8]);
}

#[derive(Clone)]
pub struct MessageDescriptor {
    pub id: u8,
    pub name: &'static str,
    pub length_style: LengthStyle,
    /// messages that carry a u32 reply correlation id in front of their payload, i.e.
    ///  requests and the built-in reply message
    pub carries_reply_id: bool,
    pub handler: Arc<dyn MessageHandler>,
}

/// The registry of known message ids for one network interface. Populated once at startup,
///  then read-only on the hot path.
pub struct DescriptorTable {
    by_id: FxHashMap<u8, MessageDescriptor>,
}

impl DescriptorTable {
    pub fn new() -> DescriptorTable {
        DescriptorTable {
            by_id: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, descriptor: MessageDescriptor) -> anyhow::Result<()> {
        if descriptor.id == REPLY_MESSAGE_ID {
            bail!("message id {REPLY_MESSAGE_ID:#04x} is reserved for replies");
        }
        descriptor.length_style.validate()?;
        if let Some(prev) = self.by_id.get(&descriptor.id) {
            bail!("message id {:#04x} registered twice (previous: {})", prev.id, prev.name);
        }
        self.by_id.insert(descriptor.id, descriptor);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Option<&MessageDescriptor> {
        self.by_id.get(&id)
    }

    /// Installs the built-in reply descriptor. Replies are always tail-length and carry
    ///  their correlation id like requests do.
    pub(crate) fn register_reply(&mut self, handler: Arc<dyn MessageHandler>) {
        self.by_id.insert(REPLY_MESSAGE_ID, MessageDescriptor {
            id: REPLY_MESSAGE_ID,
            name: "reply",
            length_style: LengthStyle::Tail,
            carries_reply_id: true,
            handler,
        });
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}
