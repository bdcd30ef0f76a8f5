use crate::bundle::Bundle;
use crate::config::{ChannelOptions, OverflowPolicy, TransportConfig};
use crate::cursor::ChainCursor;
use crate::descriptor::DescriptorTable;
use crate::frame::{self, DecodedMessage};
use crate::packet::{FragmentChain, IndexedChannelId, PacketHeader};
use crate::reactor::{TimerEvent, Timers};
use crate::receive_window::{ReceiveClass, ReceiveWindow};
use crate::send_pipeline::SendPipeline;
use crate::send_window::{AckOutcome, SendWindow};
use crate::seq::SeqNum;
use crate::timer::TimerHandle;
use anyhow::bail;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// at most this many selective acks ride piggybacked on a data packet; the reserved header
///  space accounts for them
const MAX_PIGGYBACK_SACKS: usize = 32;

/// worst-case packet header: seq + flags + indexed id/version + fragment chain + cumulative
///  ack + capped selective ack list
const RESERVED_HEADER_LEN: usize = 4 + 1 + 6 + 8 + 4 + 1 + 4 * MAX_PIGGYBACK_SACKS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// created, but nothing heard from the peer yet
    Anonymous,
    /// two-way traffic confirmed
    Established,
    /// winding down: no new messages accepted, outstanding reliable data still resent
    Condemned,
    /// fully drained; the channel is inert and can be dropped
    Destroyed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub packets_sent: u64,
    pub packets_resent: u64,
    pub packets_received: u64,
    pub duplicate_packets: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
}

/// everything a single incoming packet caused, for the caller to act on *after* releasing
///  the channel lock
#[derive(Default)]
pub struct PacketOutcome {
    pub messages: Vec<DecodedMessage>,
    /// the channel just transitioned out of `Anonymous`
    pub established: bool,
    /// the channel just reached `Destroyed`
    pub destroyed: bool,
}

struct ReceivedPacket {
    seq: SeqNum,
    fragment: Option<FragmentChain>,
    body: Vec<u8>,
}

struct FragmentAssembly {
    chain: FragmentChain,
    parts: Vec<Vec<u8>>,
}

/// One reliable, ordered conversation with a single peer address.
///
/// All protocol logic is in [ChannelInner] behind a mutex; the mutex exists so resend and
///  inactivity timer callbacks can reach the channel through a `Weak`, not for cross-thread
///  concurrency - everything runs on the dispatcher's task.
///
/// Message handlers must never be invoked while the lock is held (they may send, which
///  locks again) - that is why `on_packet` returns the decoded messages instead of
///  dispatching them itself.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Mutex<ChannelInner>>,
}

struct ChannelInner {
    config: Arc<TransportConfig>,
    options: ChannelOptions,
    peer_addr: SocketAddr,
    indexed: Option<IndexedChannelId>,
    state: ChannelState,
    /// keep asking the peer to create its end until we hear from it
    create_pending: bool,

    send_window: SendWindow,
    unreliable_next_seq: SeqNum,
    receive_window: ReceiveWindow<ReceivedPacket>,
    reliable_bundle: Bundle,
    unreliable_bundle: Bundle,
    fragments: Option<FragmentAssembly>,

    /// the peer is owed an ack for something
    ack_dirty: bool,
    /// smoothed RTT; `None` until the first fresh ack
    rtt: Option<Duration>,
    resend_timer: Option<TimerHandle>,
    last_received_at: Instant,

    pipeline: Arc<SendPipeline>,
    table: Arc<DescriptorTable>,
    self_ref: Weak<Mutex<ChannelInner>>,
    stats: ChannelStats,
}

fn lock_inner(inner: &Mutex<ChannelInner>) -> MutexGuard<'_, ChannelInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<TransportConfig>,
        options: ChannelOptions,
        peer_addr: SocketAddr,
        indexed: Option<IndexedChannelId>,
        initiated_locally: bool,
        pipeline: Arc<SendPipeline>,
        table: Arc<DescriptorTable>,
    ) -> Channel {
        let max_body_len = config.max_packet_len - RESERVED_HEADER_LEN;
        let inner = Arc::new_cyclic(|self_ref: &Weak<Mutex<ChannelInner>>| {
            Mutex::new(ChannelInner {
                send_window: SendWindow::new(config.send_window_size),
                unreliable_next_seq: SeqNum::ZERO,
                receive_window: ReceiveWindow::new(config.receive_window_size),
                reliable_bundle: Bundle::new(max_body_len),
                unreliable_bundle: Bundle::new(max_body_len),
                fragments: None,
                config,
                options,
                peer_addr,
                indexed,
                state: ChannelState::Anonymous,
                create_pending: initiated_locally,
                ack_dirty: false,
                rtt: None,
                resend_timer: None,
                last_received_at: Instant::now(),
                pipeline,
                table,
                self_ref: self_ref.clone(),
                stats: ChannelStats::default(),
            })
        });
        Channel { inner }
    }

    fn locked(&self) -> MutexGuard<'_, ChannelInner> {
        lock_inner(&self.inner)
    }

    /// Buffer a message for this channel. It goes out with the next flush.
    pub fn send_message(
        &self,
        timers: &mut Timers,
        now: Instant,
        id: u8,
        reply_id: Option<u32>,
        payload: &[u8],
        reliable: bool,
    ) -> anyhow::Result<()> {
        self.locked().send_message(timers, now, id, reply_id, payload, reliable)
    }

    /// Turn everything buffered into packets and send them.
    pub fn flush(&self, timers: &mut Timers, now: Instant) {
        self.locked().flush(timers, now);
    }

    pub fn on_packet(
        &self,
        timers: &mut Timers,
        now: Instant,
        header: &PacketHeader,
        body: &[u8],
        from: SocketAddr,
    ) -> PacketOutcome {
        self.locked().on_packet(timers, now, header, body, from)
    }

    /// Stop accepting new messages; the channel destroys itself once all outstanding
    ///  reliable data is acknowledged.
    pub fn condemn(&self, timers: &mut Timers, now: Instant) {
        self.locked().condemn(timers, now);
    }

    /// Re-point the channel at a new peer address, keeping all sequence state. For peers
    ///  whose address changes underneath an ongoing conversation (NAT rebind, failover).
    pub fn switch_address(&self, new_addr: SocketAddr) {
        let mut inner = self.locked();
        debug!("switching channel peer address {} -> {}", inner.peer_addr, new_addr);
        inner.peer_addr = new_addr;
    }

    pub fn state(&self) -> ChannelState {
        self.locked().state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.locked().peer_addr
    }

    pub fn indexed(&self) -> Option<IndexedChannelId> {
        self.locked().indexed
    }

    pub fn auto_switches_to_first_sender(&self) -> bool {
        self.locked().options.auto_switch_to_first_sender
    }

    pub fn stats(&self) -> ChannelStats {
        self.locked().stats
    }

    pub fn last_received_at(&self) -> Instant {
        self.locked().last_received_at
    }
}

impl ChannelInner {
    fn max_body_len(&self) -> usize {
        self.config.max_packet_len - RESERVED_HEADER_LEN
    }

    fn send_message(
        &mut self,
        timers: &mut Timers,
        now: Instant,
        id: u8,
        reply_id: Option<u32>,
        payload: &[u8],
        reliable: bool,
    ) -> anyhow::Result<()> {
        match self.state {
            ChannelState::Condemned | ChannelState::Destroyed => {
                bail!("channel to {} is shut down", self.peer_addr);
            }
            ChannelState::Anonymous | ChannelState::Established => {}
        }

        let Some(descriptor) = self.table.get(id) else {
            bail!("message id {:#04x} is not registered", id);
        };
        if descriptor.carries_reply_id != reply_id.is_some() {
            bail!("message {} and correlation id do not match: requests carry one, other messages must not", descriptor.name);
        }
        let length_style = descriptor.length_style;
        let encoded_len = frame::encoded_len(length_style, reply_id.is_some(), payload.len());
        let max_body_len = self.max_body_len();

        if reliable {
            self.check_send_overflow(timers, now)?;

            // a flush turns the bundle into one fragment chain - split early rather than
            //  produce a chain the receiver would refuse
            let message_bodies = encoded_len.div_ceil(max_body_len);
            if message_bodies > self.config.max_fragment_chain_packets {
                bail!("message of {} bytes exceeds the fragment chain limit", payload.len());
            }
            if self.reliable_bundle.body_count() + message_bodies > self.config.max_fragment_chain_packets {
                self.flush(timers, now);
            }

            frame::encode_message(&mut self.reliable_bundle, id, length_style, reply_id, payload)?;
        }
        else {
            if encoded_len > max_body_len {
                bail!("unreliable message of {} bytes does not fit a single packet", payload.len());
            }
            // unreliable packets stand alone - a message must never straddle two of them
            if encoded_len > self.unreliable_bundle.current_body_remaining() {
                self.unreliable_bundle.seal_body();
            }
            frame::encode_message(&mut self.unreliable_bundle, id, length_style, reply_id, payload)?;
        }

        self.stats.messages_sent += 1;
        Ok(())
    }

    fn check_send_overflow(&mut self, timers: &mut Timers, now: Instant) -> anyhow::Result<()> {
        let outstanding = self.send_window.len();
        if outstanding >= self.config.send_window_size + self.config.hard_overflow_ceiling {
            warn!("send window overflow beyond the hard ceiling - condemning channel to {}", self.peer_addr);
            self.condemn(timers, now);
            bail!("channel to {} condemned: send window overflow", self.peer_addr);
        }

        let max_overflow = self.config.max_overflow(self.options.kind, self.indexed.is_some());
        if outstanding >= self.config.send_window_size + max_overflow {
            match self.config.overflow_policy {
                OverflowPolicy::Reject => {
                    bail!("send window to {} is full", self.peer_addr);
                }
                OverflowPolicy::ForceFlush => {
                    debug!("send window to {} overflowing, nudging the peer with a resend", self.peer_addr);
                    self.resend_oldest(now);
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self, timers: &mut Timers, now: Instant) {
        if self.state == ChannelState::Destroyed {
            return;
        }

        let reliable_bodies = self.reliable_bundle.take_bodies();
        if !reliable_bodies.is_empty() {
            let count = reliable_bodies.len() as u32;
            let begin = self.send_window.next_to_send();
            let fragment = (count > 1)
                .then(|| FragmentChain { begin, end: begin.plus(count - 1) });

            for (idx, body) in reliable_bodies.into_iter().enumerate() {
                let seq = self.send_window.next_seq();
                let mut header = PacketHeader::new(seq, true);
                header.create_channel = self.create_pending;
                header.indexed = self.indexed;
                header.fragment = fragment;
                if idx == 0 {
                    let (cum, sacks) = self.take_ack_fields();
                    header.cumulative_ack = cum;
                    header.selective_acks = sacks;
                }

                let mut buf = BytesMut::with_capacity(header.serialized_len() + body.len());
                header.ser(&mut buf);
                buf.extend_from_slice(&body);
                let packet = buf.freeze();

                self.send_window.record(seq, packet.clone(), now);
                self.pipeline.send_packet(self.peer_addr, &packet);
                self.stats.packets_sent += 1;
            }
            self.arm_resend_timer(timers, now);
        }

        for body in self.unreliable_bundle.take_bodies() {
            let seq = self.unreliable_next_seq;
            self.unreliable_next_seq = seq.next();

            let mut header = PacketHeader::new(seq, false);
            header.create_channel = self.create_pending;
            header.indexed = self.indexed;
            if self.ack_dirty {
                let (cum, sacks) = self.take_ack_fields();
                header.cumulative_ack = cum;
                header.selective_acks = sacks;
            }

            let mut buf = BytesMut::with_capacity(header.serialized_len() + body.len());
            header.ser(&mut buf);
            buf.extend_from_slice(&body);
            self.pipeline.send_packet(self.peer_addr, &buf);
            self.stats.packets_sent += 1;
        }

        if self.ack_dirty {
            self.send_standalone_ack();
        }
    }

    /// a data-less packet whose only job is to carry acks
    fn send_standalone_ack(&mut self) {
        let (cum, sacks) = self.take_ack_fields();
        if cum.is_none() && sacks.is_empty() {
            return;
        }

        let seq = self.unreliable_next_seq;
        self.unreliable_next_seq = seq.next();

        let mut header = PacketHeader::new(seq, false);
        header.indexed = self.indexed;
        header.cumulative_ack = cum;
        header.selective_acks = sacks;

        let mut buf = BytesMut::with_capacity(header.serialized_len());
        header.ser(&mut buf);
        self.pipeline.send_packet(self.peer_addr, &buf);
        self.stats.packets_sent += 1;
        trace!("sent standalone ack to {}", self.peer_addr);
    }

    fn take_ack_fields(&mut self) -> (Option<SeqNum>, Vec<SeqNum>) {
        self.ack_dirty = false;
        let cum = self.receive_window.cumulative_ack();
        let mut sacks = self.receive_window.buffered_seqs();
        sacks.truncate(MAX_PIGGYBACK_SACKS);
        (cum, sacks)
    }

    fn on_packet(
        &mut self,
        timers: &mut Timers,
        now: Instant,
        header: &PacketHeader,
        body: &[u8],
        from: SocketAddr,
    ) -> PacketOutcome {
        let mut outcome = PacketOutcome::default();
        if self.state == ChannelState::Destroyed {
            return outcome;
        }

        if let (Some(mine), Some(theirs)) = (self.indexed, header.indexed) {
            let version_delta = theirs.version.wrapping_sub(mine.version) as i32;
            if version_delta < 0 {
                // stale traffic must not count as channel activity, or a dead peer's
                //  leftover packets would keep the channel from timing out
                debug!("dropping packet with stale channel version {} (current {})", theirs.version, mine.version);
                return outcome;
            }
            if version_delta > 0 {
                debug!("peer of channel {} restarted (version {} -> {}), resetting", mine.id, mine.version, theirs.version);
                self.adopt_peer_version(timers, theirs.version);
            }
        }
        self.stats.packets_received += 1;
        self.last_received_at = now;

        if self.options.auto_switch_to_first_sender
            && self.state == ChannelState::Anonymous
            && from != self.peer_addr
        {
            debug!("adopting first sender {} as peer address (was {})", from, self.peer_addr);
            self.peer_addr = from;
        }
        self.create_pending = false;
        if self.state == ChannelState::Anonymous {
            self.state = ChannelState::Established;
            outcome.established = true;
        }

        self.process_acks(now, header);
        if self.send_window.is_empty() {
            self.cancel_resend_timer(timers);
        }

        if !body.is_empty() {
            if header.reliable {
                self.receive_reliable(header, body, &mut outcome.messages);
            }
            else if header.fragment.is_some() {
                warn!("dropping unreliable packet with fragment markers from {}", from);
            }
            else {
                self.decode_parts(&[body], &mut outcome.messages);
            }
        }

        // a side that does not flush regularly must ack on the spot
        if self.ack_dirty && !self.options.locally_regular {
            self.send_standalone_ack();
        }

        if self.maybe_destroy(timers) {
            outcome.destroyed = true;
        }
        outcome
    }

    fn process_acks(&mut self, now: Instant, header: &PacketHeader) {
        if let Some(cum) = header.cumulative_ack {
            if self.send_window.was_sent(cum) {
                let retired = self.send_window.retire_through(cum);
                // the youngest packet first acked by this very ack gives the best sample
                let sample = retired.iter()
                    .filter(|slot| !slot.was_resent && !slot.acked)
                    .map(|slot| now.duration_since(slot.sent_at))
                    .min();
                if let Some(sample) = sample {
                    self.record_rtt_sample(sample);
                }
            }
            else {
                warn!("ignoring cumulative ack {} from {} for a packet never sent", cum, self.peer_addr);
            }
        }

        let mut fresh_hole = false;
        for &sack in &header.selective_acks {
            match self.send_window.mark_acked(sack) {
                AckOutcome::Fresh { was_resent, sent_at, hole_behind } => {
                    if !was_resent {
                        self.record_rtt_sample(now.duration_since(sent_at));
                    }
                    fresh_hole |= hole_behind;
                }
                AckOutcome::OutOfRange => {
                    warn!("ignoring selective ack {} from {} for a packet never sent", sack, self.peer_addr);
                }
                AckOutcome::AlreadyAcked | AckOutcome::Retired => {}
            }
        }

        // a regularly-acking peer skipping a packet means it is lost, not late - resend
        //  without waiting for the timer, once the packet is old enough to rule out a race
        if fresh_hole && self.options.peer_regular {
            let rtt = self.rtt.unwrap_or(self.config.initial_rtt);
            let old_enough = self.send_window.oldest_slot_mut()
                .map(|slot| now.duration_since(slot.sent_at) > rtt)
                .unwrap_or(false);
            if old_enough {
                self.resend_oldest(now);
            }
        }
    }

    fn receive_reliable(&mut self, header: &PacketHeader, body: &[u8], messages: &mut Vec<DecodedMessage>) {
        match self.receive_window.classify(header.seq) {
            ReceiveClass::NextInWindow | ReceiveClass::BufferedInWindow => {
                self.ack_dirty = true;
                self.receive_window.insert(header.seq, ReceivedPacket {
                    seq: header.seq,
                    fragment: header.fragment,
                    body: body.to_vec(),
                });
                while let Some(packet) = self.receive_window.take_next_ready() {
                    self.process_delivered(packet, messages);
                }
            }
            ReceiveClass::Duplicate => {
                trace!("duplicate packet {} from {} - re-acking", header.seq, self.peer_addr);
                self.stats.duplicate_packets += 1;
                self.ack_dirty = true;
            }
            ReceiveClass::OutOfWindow => {
                warn!("dropping packet {} from {}: outside the receive window", header.seq, self.peer_addr);
            }
        }
    }

    /// a packet has left the receive window in order - feed it to reassembly / decoding
    fn process_delivered(&mut self, packet: ReceivedPacket, messages: &mut Vec<DecodedMessage>) {
        let Some(chain) = packet.fragment else {
            if self.fragments.is_some() {
                warn!("fragment chain from {} interrupted by an unfragmented packet - discarding it", self.peer_addr);
                self.fragments = None;
            }
            self.decode_parts(&[packet.body], messages);
            return;
        };

        let chain_len = chain.end.diff(chain.begin);
        if chain_len <= 0 || chain_len as usize >= self.config.max_fragment_chain_packets {
            warn!("dropping packet of implausible fragment chain {:?} from {}", chain, self.peer_addr);
            self.fragments = None;
            return;
        }

        match &mut self.fragments {
            Some(assembly) if assembly.chain == chain => {
                assembly.parts.push(packet.body);
            }
            other => {
                if other.is_some() {
                    warn!("fragment chain from {} superseded before completion - discarding it", self.peer_addr);
                }
                if packet.seq != chain.begin {
                    // can only happen right after a reset swallowed the chain's head
                    warn!("fragment chain {:?} from {} starts mid-chain - dropping", chain, self.peer_addr);
                    *other = None;
                    return;
                }
                *other = Some(FragmentAssembly { chain, parts: vec![packet.body] });
            }
        }

        if packet.seq == chain.end {
            if let Some(assembly) = self.fragments.take() {
                self.decode_parts(&assembly.parts, messages);
            }
        }
    }

    fn decode_parts<B: AsRef<[u8]>>(&mut self, parts: &[B], messages: &mut Vec<DecodedMessage>) {
        let mut cursor = ChainCursor::new(parts);
        while cursor.has_remaining() {
            match frame::decode_next(&mut cursor, &self.table) {
                Ok(message) => {
                    self.stats.messages_delivered += 1;
                    messages.push(message);
                }
                Err(e) => {
                    warn!("corrupt message data from {}: {:#} - dropping the rest of the packet", self.peer_addr, e);
                    break;
                }
            }
        }
    }

    /// the peer restarted: all sequence state refers to its previous life and is void
    fn adopt_peer_version(&mut self, timers: &mut Timers, version: u32) {
        if let Some(indexed) = &mut self.indexed {
            indexed.version = version;
        }
        self.send_window = SendWindow::new(self.config.send_window_size);
        self.receive_window.reset();
        self.fragments = None;
        self.ack_dirty = false;
        self.rtt = None;
        self.cancel_resend_timer(timers);
    }

    fn record_rtt_sample(&mut self, sample: Duration) {
        let updated = match self.rtt {
            None => sample,
            Some(prev) => {
                let alpha = self.config.rtt_smoothing;
                Duration::from_secs_f64(prev.as_secs_f64() * (1.0 - alpha) + sample.as_secs_f64() * alpha)
            }
        };
        trace!("rtt sample {:?} for {}, smoothed {:?}", sample, self.peer_addr, updated);
        self.rtt = Some(updated);
    }

    fn resend_oldest(&mut self, now: Instant) {
        let peer_addr = self.peer_addr;
        if let Some(slot) = self.send_window.oldest_slot_mut() {
            slot.was_resent = true;
            slot.sent_at = now;
            debug!("resending packet {} to {}", slot.seq, peer_addr);
            self.pipeline.send_packet(peer_addr, &slot.packet);
            self.stats.packets_resent += 1;
        }
    }

    fn arm_resend_timer(&mut self, timers: &mut Timers, now: Instant) {
        if self.resend_timer.is_some() || self.send_window.is_empty() {
            return;
        }
        let delay = self.config.resend_delay(self.rtt.unwrap_or(self.config.initial_rtt));
        let weak = self.self_ref.clone();
        let handle = timers.schedule_once(now + delay, TimerEvent::new(move |timers, _| {
            if let Some(channel) = weak.upgrade() {
                lock_inner(&channel).on_resend_timer_fired(timers, Instant::now());
            }
        }));
        self.resend_timer = Some(handle);
    }

    fn cancel_resend_timer(&mut self, timers: &mut Timers) {
        if let Some(handle) = self.resend_timer.take() {
            timers.cancel(handle);
        }
    }

    fn on_resend_timer_fired(&mut self, timers: &mut Timers, now: Instant) {
        self.resend_timer = None;
        if self.send_window.is_empty() || self.state == ChannelState::Destroyed {
            return;
        }
        self.resend_oldest(now);
        self.arm_resend_timer(timers, now);
    }

    fn condemn(&mut self, timers: &mut Timers, now: Instant) {
        match self.state {
            ChannelState::Condemned | ChannelState::Destroyed => return,
            ChannelState::Anonymous | ChannelState::Established => {}
        }
        debug!("condemning channel to {}", self.peer_addr);
        self.state = ChannelState::Condemned;

        // already-accepted messages still go out; new ones are refused from here on
        self.flush(timers, now);
        self.maybe_destroy(timers);
    }

    fn maybe_destroy(&mut self, timers: &mut Timers) -> bool {
        if self.state == ChannelState::Condemned
            && self.send_window.is_empty()
            && self.reliable_bundle.is_empty()
        {
            debug!("channel to {} fully drained - destroyed", self.peer_addr);
            self.cancel_resend_timer(timers);
            self.state = ChannelState::Destroyed;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{LengthStyle, MessageDescriptor, MessageHandler, MessageSource};
    use crate::send_pipeline::MockSendSocket;
    use crate::timer::TimerQueue;
    use rstest::rstest;

    const MSG_VAR: u8 = 1;
    const MSG_TAIL: u8 = 2;
    const MSG_REQ: u8 = 3;

    struct NopHandler;
    impl MessageHandler for NopHandler {
        fn on_message(&self, _timers: &mut Timers, _source: &MessageSource, _payload: &[u8]) {}
    }

    fn test_table() -> Arc<DescriptorTable> {
        let mut table = DescriptorTable::new();
        for (id, length_style, carries_reply_id) in [
            (MSG_VAR, LengthStyle::Variable(2), false),
            (MSG_TAIL, LengthStyle::Tail, false),
            (MSG_REQ, LengthStyle::Variable(2), true),
        ] {
            table.register(MessageDescriptor {
                id,
                name: "test",
                length_style,
                carries_reply_id,
                handler: Arc::new(NopHandler),
            }).unwrap();
        }
        Arc::new(table)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn local() -> SocketAddr {
        "127.0.0.1:4001".parse().unwrap()
    }

    type SentPackets = Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>;

    fn capturing_channel(
        config: TransportConfig,
        options: ChannelOptions,
        indexed: Option<IndexedChannelId>,
        initiated_locally: bool,
    ) -> (Channel, SentPackets) {
        let sent: SentPackets = Arc::new(Mutex::new(Vec::new()));
        let sent_for_mock = sent.clone();
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .returning(move |to, packet| sent_for_mock.lock().unwrap().push((to, packet.to_vec())));

        let channel = Channel::new(
            Arc::new(config),
            options,
            peer(),
            indexed,
            initiated_locally,
            Arc::new(SendPipeline::new(Arc::new(socket), local())),
            test_table(),
        );
        (channel, sent)
    }

    fn default_channel() -> (Channel, SentPackets) {
        regular_options_channel(TransportConfig::default())
    }

    fn regular_options_channel(config: TransportConfig) -> (Channel, SentPackets) {
        capturing_channel(config, ChannelOptions::regular(crate::config::ChannelKind::Internal), None, true)
    }

    fn parse(packet: &[u8]) -> (PacketHeader, Vec<u8>) {
        let mut buf = packet;
        let header = PacketHeader::deser(&mut buf).unwrap();
        (header, buf.to_vec())
    }

    fn take_sent(sent: &SentPackets) -> Vec<(PacketHeader, Vec<u8>)> {
        std::mem::take(&mut *sent.lock().unwrap()).iter()
            .map(|(_, packet)| parse(packet))
            .collect()
    }

    fn fire_timers(timers: &mut Timers, now: Instant) -> usize {
        timers.process(now, |timers, handle, event| (event.0)(timers, handle))
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_send_and_flush() {
        let (channel, sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        channel.send_message(&mut timers, now, MSG_VAR, None, b"hello", true).unwrap();
        assert!(sent.lock().unwrap().is_empty(), "nothing leaves before a flush");

        channel.flush(&mut timers, now);
        let packets = take_sent(&sent);
        assert_eq!(packets.len(), 1);

        let (header, body) = &packets[0];
        assert_eq!(header.seq, SeqNum::ZERO);
        assert!(header.reliable);
        assert!(header.create_channel, "locally initiated channel advertises creation");
        assert!(header.fragment.is_none());
        assert_eq!(body, &vec![MSG_VAR, 0, 5, b'h', b'e', b'l', b'l', b'o']);

        assert_eq!(channel.stats().packets_sent, 1);
        assert_eq!(timers.len(), 1, "resend timer armed");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_small_messages_share_one_packet() {
        let (channel, sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        channel.send_message(&mut timers, now, MSG_VAR, None, b"a", true).unwrap();
        channel.send_message(&mut timers, now, MSG_VAR, None, b"b", true).unwrap();
        channel.flush(&mut timers, now);

        let packets = take_sent(&sent);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].1, vec![MSG_VAR, 0, 1, b'a', MSG_VAR, 0, 1, b'b']);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_cumulative_ack_retires_and_cancels_resend_timer() {
        let (channel, sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        for _ in 0..2 {
            channel.send_message(&mut timers, now, MSG_VAR, None, b"x", true).unwrap();
            channel.flush(&mut timers, now);
        }
        take_sent(&sent);
        assert_eq!(timers.len(), 1);

        let mut ack = PacketHeader::new(SeqNum::ZERO, false);
        ack.cumulative_ack = Some(SeqNum::from_raw(1));
        let outcome = channel.on_packet(&mut timers, now, &ack, &[], peer());
        assert!(outcome.established);
        assert!(outcome.messages.is_empty());

        assert!(timers.is_empty(), "resend timer cancelled once nothing is outstanding");
        assert_eq!(channel.state(), ChannelState::Established);

        // nothing fires later either
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(fire_timers(&mut timers, Instant::now()), 0);
        assert_eq!(channel.stats().packets_resent, 0);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_resend_timer_resends_oldest_verbatim() {
        let (channel, sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        channel.send_message(&mut timers, now, MSG_VAR, None, b"lost", true).unwrap();
        channel.flush(&mut timers, now);
        let first = std::mem::take(&mut *sent.lock().unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(fire_timers(&mut timers, Instant::now()), 1);

        let resent = std::mem::take(&mut *sent.lock().unwrap());
        assert_eq!(resent, first, "resends are byte-identical");
        assert_eq!(channel.stats().packets_resent, 1);
        assert_eq!(timers.len(), 1, "timer re-armed for the next attempt");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_selective_ack_hole_triggers_early_resend() {
        let (channel, sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        // packet 0 goes out well before 1 and 2
        channel.send_message(&mut timers, now, MSG_VAR, None, b"x", true).unwrap();
        channel.flush(&mut timers, now);
        tokio::time::advance(Duration::from_millis(500)).await;
        let mid = Instant::now();
        for _ in 0..2 {
            channel.send_message(&mut timers, mid, MSG_VAR, None, b"x", true).unwrap();
            channel.flush(&mut timers, mid);
        }
        take_sent(&sent);

        // the peer acks 1 and 2 but not 0: 0 is a hole, and much older than the RTT the
        //  acks for 1 and 2 imply
        tokio::time::advance(Duration::from_millis(500)).await;
        let later = Instant::now();
        let mut ack = PacketHeader::new(SeqNum::ZERO, false);
        ack.selective_acks = vec![SeqNum::from_raw(1), SeqNum::from_raw(2)];
        channel.on_packet(&mut timers, later, &ack, &[], peer());

        assert_eq!(channel.stats().packets_resent, 1);
        let packets = take_sent(&sent);
        assert_eq!(packets[0].0.seq, SeqNum::ZERO, "the hole is what gets resent");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_receive_in_order_delivers_messages() {
        let (channel, _sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let mut header = PacketHeader::new(SeqNum::ZERO, true);
        header.cumulative_ack = None;
        let body = vec![MSG_VAR, 0, 2, 0xaa, 0xbb];
        let outcome = channel.on_packet(&mut timers, now, &header, &body, peer());

        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].id, MSG_VAR);
        assert_eq!(outcome.messages[0].payload, vec![0xaa, 0xbb]);
        assert_eq!(channel.stats().messages_delivered, 1);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_buffered_and_released_in_order() {
        let (channel, _sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let body_for = |tag: u8| vec![MSG_VAR, 0, 1, tag];

        let header1 = PacketHeader::new(SeqNum::from_raw(1), true);
        let outcome = channel.on_packet(&mut timers, now, &header1, &body_for(1), peer());
        assert!(outcome.messages.is_empty(), "held back behind the gap");

        let header0 = PacketHeader::new(SeqNum::ZERO, true);
        let outcome = channel.on_packet(&mut timers, now, &header0, &body_for(0), peer());
        let tags: Vec<u8> = outcome.messages.iter().map(|m| m.payload[0]).collect();
        assert_eq!(tags, vec![0, 1]);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_duplicate_packet_counted_and_reacked() {
        let config = TransportConfig::default();
        let mut options = ChannelOptions::regular(crate::config::ChannelKind::Internal);
        options.locally_regular = false; // irregular side acks immediately
        let (channel, sent) = capturing_channel(config, options, None, false);
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let header = PacketHeader::new(SeqNum::ZERO, true);
        let body = vec![MSG_VAR, 0, 1, 0x55];
        channel.on_packet(&mut timers, now, &header, &body, peer());
        let first_acks = take_sent(&sent);
        assert_eq!(first_acks.len(), 1);
        assert_eq!(first_acks[0].0.cumulative_ack, Some(SeqNum::ZERO));
        assert!(!first_acks[0].0.reliable);

        let outcome = channel.on_packet(&mut timers, now, &header, &body, peer());
        assert!(outcome.messages.is_empty(), "duplicates are not re-delivered");
        assert_eq!(channel.stats().duplicate_packets, 1);

        let re_acks = take_sent(&sent);
        assert_eq!(re_acks.len(), 1, "duplicate still provokes a fresh ack");
        assert_eq!(re_acks[0].0.cumulative_ack, Some(SeqNum::ZERO));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_fragmented_message_round_trip() {
        let (alice, alice_sent) = default_channel();
        let (bob, _bob_sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        alice.send_message(&mut timers, now, MSG_VAR, None, &payload, true).unwrap();
        alice.flush(&mut timers, now);

        let packets = take_sent(&alice_sent);
        assert!(packets.len() > 1, "5000 bytes must fragment");
        let chain = packets[0].0.fragment.unwrap();
        assert_eq!(chain.begin, packets[0].0.seq);
        assert_eq!(chain.end, packets.last().unwrap().0.seq);

        let mut delivered = Vec::new();
        for (header, body) in &packets {
            assert_eq!(header.fragment, Some(chain));
            let outcome = bob.on_packet(&mut timers, now, header, body, peer());
            delivered.extend(outcome.messages);
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, payload);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_of_body_len_fills_the_chain_limit() {
        // max_body_len is 104 here; 1 id byte + 2 length bytes + 205 payload bytes fill
        //  exactly two bodies, which is exactly the configured chain limit
        let config = TransportConfig {
            max_packet_len: 256,
            max_fragment_chain_packets: 2,
            ..Default::default()
        };
        let (channel, sent) = regular_options_channel(config);
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        channel.send_message(&mut timers, now, MSG_VAR, None, &vec![0x33; 205], true).unwrap();
        channel.flush(&mut timers, now);
        let packets = take_sent(&sent);
        assert_eq!(packets.len(), 2);
        assert!(packets[0].0.fragment.is_some());

        // one more byte needs a third body and is over the limit
        assert!(channel.send_message(&mut timers, now, MSG_VAR, None, &vec![0x33; 206], true).is_err());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_fragments_survive_reordering() {
        let (alice, alice_sent) = default_channel();
        let (bob, _) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let payload: Vec<u8> = vec![0x42; 3000];
        alice.send_message(&mut timers, now, MSG_VAR, None, &payload, true).unwrap();
        alice.flush(&mut timers, now);

        let mut packets = take_sent(&alice_sent);
        assert!(packets.len() >= 2);
        packets.reverse();

        let mut delivered = Vec::new();
        for (header, body) in &packets {
            delivered.extend(bob.on_packet(&mut timers, now, header, body, peer()).messages);
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, payload);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_stale_indexed_version_is_dropped() {
        let indexed = IndexedChannelId { id: 3, version: 5 };
        let (channel, _) = capturing_channel(
            TransportConfig::default(),
            ChannelOptions::regular(crate::config::ChannelKind::Internal),
            Some(indexed),
            false,
        );
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let mut header = PacketHeader::new(SeqNum::ZERO, true);
        header.indexed = Some(IndexedChannelId { id: 3, version: 4 });
        let body = vec![MSG_VAR, 0, 1, 0x11];
        let outcome = channel.on_packet(&mut timers, now, &header, &body, peer());

        assert!(outcome.messages.is_empty());
        assert_eq!(channel.state(), ChannelState::Anonymous, "stale packets change nothing");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_stale_version_packet_is_not_channel_activity() {
        let indexed = IndexedChannelId { id: 3, version: 5 };
        let (channel, _) = capturing_channel(
            TransportConfig::default(),
            ChannelOptions::regular(crate::config::ChannelKind::Internal),
            Some(indexed),
            false,
        );
        let mut timers: Timers = TimerQueue::new();
        let created_at = channel.last_received_at();

        tokio::time::advance(Duration::from_secs(5)).await;
        let mut header = PacketHeader::new(SeqNum::ZERO, true);
        header.indexed = Some(IndexedChannelId { id: 3, version: 4 });
        channel.on_packet(&mut timers, Instant::now(), &header, &[MSG_VAR, 0, 1, 1], peer());

        // a dead peer's leftover traffic must not keep the channel looking alive
        assert_eq!(channel.last_received_at(), created_at);
        assert_eq!(channel.stats().packets_received, 0);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_newer_indexed_version_resets_channel() {
        let indexed = IndexedChannelId { id: 3, version: 5 };
        let (channel, _) = capturing_channel(
            TransportConfig::default(),
            ChannelOptions::regular(crate::config::ChannelKind::Internal),
            Some(indexed),
            false,
        );
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        // deliver one packet in the old life so the receive window has state
        let mut header = PacketHeader::new(SeqNum::ZERO, true);
        header.indexed = Some(indexed);
        channel.on_packet(&mut timers, now, &header, &[MSG_VAR, 0, 1, 1], peer());

        // the peer restarts: its sequence numbers begin at zero again
        let mut restarted = PacketHeader::new(SeqNum::ZERO, true);
        restarted.indexed = Some(IndexedChannelId { id: 3, version: 6 });
        let outcome = channel.on_packet(&mut timers, now, &restarted, &[MSG_VAR, 0, 1, 2], peer());

        assert_eq!(outcome.messages.len(), 1, "seq 0 is fresh again after the reset");
        assert_eq!(outcome.messages[0].payload, vec![2]);
        assert_eq!(channel.indexed().unwrap().version, 6);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_overflow_reject_policy() {
        let config = TransportConfig {
            send_window_size: 1,
            max_overflow_internal: 0,
            overflow_policy: OverflowPolicy::Reject,
            ..Default::default()
        };
        let (channel, sent) = regular_options_channel(config);
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        channel.send_message(&mut timers, now, MSG_VAR, None, b"1", true).unwrap();
        channel.flush(&mut timers, now);
        take_sent(&sent);

        // the window (plus zero overflow allowance) is full - the next send is refused
        assert!(channel.send_message(&mut timers, now, MSG_VAR, None, b"2", true).is_err());

        // acking frees the window again
        let mut ack = PacketHeader::new(SeqNum::ZERO, false);
        ack.cumulative_ack = Some(SeqNum::ZERO);
        channel.on_packet(&mut timers, now, &ack, &[], peer());
        assert!(channel.send_message(&mut timers, now, MSG_VAR, None, b"2", true).is_ok());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_hard_overflow_condemns() {
        let config = TransportConfig {
            send_window_size: 1,
            max_overflow_internal: 0,
            overflow_policy: OverflowPolicy::ForceFlush,
            hard_overflow_ceiling: 2,
            ..Default::default()
        };
        let (channel, _) = regular_options_channel(config);
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let mut rejected = false;
        for _ in 0..10 {
            if channel.send_message(&mut timers, now, MSG_VAR, None, b"x", true).is_err() {
                rejected = true;
                break;
            }
            channel.flush(&mut timers, now);
        }
        assert!(rejected);
        assert_eq!(channel.state(), ChannelState::Condemned);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_condemned_channel_drains_then_destroys() {
        let (channel, sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        channel.send_message(&mut timers, now, MSG_VAR, None, b"bye", true).unwrap();
        channel.condemn(&mut timers, now);
        assert_eq!(channel.state(), ChannelState::Condemned);
        assert_eq!(take_sent(&sent).len(), 1, "condemning flushes pending data");

        assert!(channel.send_message(&mut timers, now, MSG_VAR, None, b"no", true).is_err());

        let mut ack = PacketHeader::new(SeqNum::ZERO, false);
        ack.cumulative_ack = Some(SeqNum::ZERO);
        let outcome = channel.on_packet(&mut timers, now, &ack, &[], peer());
        assert!(outcome.destroyed);
        assert_eq!(channel.state(), ChannelState::Destroyed);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_auto_switch_adopts_first_sender() {
        let mut options = ChannelOptions::regular(crate::config::ChannelKind::External);
        options.auto_switch_to_first_sender = true;
        let (channel, _) = capturing_channel(TransportConfig::default(), options, None, false);
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let actual_sender: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let header = PacketHeader::new(SeqNum::ZERO, true);
        channel.on_packet(&mut timers, now, &header, &[MSG_VAR, 0, 1, 9], actual_sender);

        assert_eq!(channel.peer_addr(), actual_sender);
        assert_eq!(channel.state(), ChannelState::Established);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_unreliable_messages_bypass_the_receive_window() {
        let (channel, sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        // an unreliable packet with an arbitrary sequence number delivers immediately
        let header = PacketHeader::new(SeqNum::from_raw(777), false);
        let outcome = channel.on_packet(&mut timers, now, &header, &[MSG_VAR, 0, 1, 7], peer());
        assert_eq!(outcome.messages.len(), 1);

        // and the reliable stream is unaffected: seq 0 is still what is expected next
        let reliable = PacketHeader::new(SeqNum::ZERO, true);
        let outcome = channel.on_packet(&mut timers, now, &reliable, &[MSG_VAR, 0, 1, 8], peer());
        assert_eq!(outcome.messages.len(), 1);

        channel.send_message(&mut timers, now, MSG_VAR, None, b"u", false).unwrap();
        channel.flush(&mut timers, now);
        let packets = take_sent(&sent);
        let last = packets.last().unwrap();
        assert!(!last.0.reliable);
        assert!(timers.is_empty(), "no resend timer for unreliable data");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_rtt_estimate_from_ack_timing() {
        let (channel, sent) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        channel.send_message(&mut timers, now, MSG_VAR, None, b"ping", true).unwrap();
        channel.flush(&mut timers, now);
        take_sent(&sent);

        let mut ack = PacketHeader::new(SeqNum::ZERO, false);
        ack.cumulative_ack = Some(SeqNum::ZERO);
        channel.on_packet(&mut timers, now + Duration::from_millis(80), &ack, &[], peer());

        let rtt = channel.locked().rtt.unwrap();
        assert_eq!(rtt, Duration::from_millis(80), "first sample seeds the estimate");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_corrupt_message_data_dropped_without_delivery() {
        let (channel, _) = default_channel();
        let mut timers: Timers = TimerQueue::new();
        let now = Instant::now();

        let header = PacketHeader::new(SeqNum::ZERO, true);
        // unknown message id 99
        let outcome = channel.on_packet(&mut timers, now, &header, &[99, 0, 1, 1], peer());
        assert!(outcome.messages.is_empty());
        assert_eq!(channel.stats().messages_delivered, 0);
    }
}
