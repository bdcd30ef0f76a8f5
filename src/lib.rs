//! Reliable, ordered message delivery over plain UDP.
//!
//! The crate provides point-to-point *channels* that carry application messages with
//!  TCP-like guarantees (in-order delivery, retransmission, duplicate suppression) while
//!  keeping UDP's properties where they help: no connection handshake, cheap fan-out to
//!  many peers from one socket, and an explicit escape hatch for fire-and-forget traffic.
//!
//! Packets on the wire look like this:
//!
//! ```text
//! +--------------+---------+----------------------------------------+-----------------+
//! | seq (u32 BE) | flags   | optional header fields, flag-dependent | message data... |
//! +--------------+---------+----------------------------------------+-----------------+
//!                            indexed channel id/version, fragment
//!                            chain bounds, cumulative ack,
//!                            selective acks
//! ```
//!
//! and each message inside a packet body is `id (u8)` followed by a length field whose
//!  shape the message's [descriptor::MessageDescriptor] determines, then the payload.
//!
//! The building blocks, bottom to top:
//! * [seq]: sequence number arithmetic on a wrapping u32
//! * [timer], [reactor]: a single-task event loop multiplexing sockets and timers
//! * [bundle], [frame], [cursor]: message serialization into packet bodies and back
//! * [packet]: the packet header wire format
//! * [send_window], [receive_window]: the sliding windows behind reliable delivery
//! * [channel]: the per-peer protocol state machine
//! * [interface]: one socket's worth of channels, message dispatch and request/reply
//!
//! Applications register [descriptor::MessageDescriptor]s for their message ids, bind a
//!  [interface::NetworkInterface], attach it to an [reactor::EventDispatcher] and drive
//!  that dispatcher; everything else happens through handlers.

pub mod bundle;
pub mod channel;
pub mod config;
pub mod cursor;
pub mod descriptor;
pub mod frame;
pub mod interface;
pub mod packet;
pub mod reactor;
pub mod receive_window;
pub mod send_pipeline;
pub mod send_window;
pub mod seq;
pub mod timer;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
