use crate::channel::{Channel, ChannelState, ChannelStats};
use crate::config::{ChannelOptions, TransportConfig};
use crate::descriptor::{DescriptorTable, MessageHandler, MessageSource, REPLY_MESSAGE_ID};
use crate::frame::DecodedMessage;
use crate::packet::{IndexedChannelId, PacketHeader};
use crate::reactor::{EventDispatcher, InputHandler, TimerEvent, Timers};
use crate::send_pipeline::{SendPipeline, SendSocket};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle notifications for the application. Called on the dispatcher's task, outside
///  all interface locks.
pub trait ChannelListener: Send + Sync + 'static {
    fn on_channel_established(&self, _peer: SocketAddr, _index: Option<u16>) {}
    fn on_channel_lost(&self, _peer: SocketAddr, _index: Option<u16>) {}
}

/// listener for applications that do not care about channel lifecycle
pub struct NopChannelListener;
impl ChannelListener for NopChannelListener {}

/// a channel is identified by its peer address plus the indexed-channel id, if any
type ChannelKey = (SocketAddr, Option<u16>);

/// One UDP socket's worth of reliable messaging: the channel registry, message dispatch,
///  reply correlation and channel lifecycle management.
///
/// An interface is passive - it does work only when its socket handler, frequent task or
///  timers run, all of which happen inside the ticks of the dispatcher it is attached to.
pub struct NetworkInterface {
    socket: Arc<UdpSocket>,
    pipeline: Arc<SendPipeline>,
    config: Arc<TransportConfig>,
    table: Arc<DescriptorTable>,
    default_options: ChannelOptions,
    channels: Mutex<FxHashMap<ChannelKey, Channel>>,
    replies: Arc<ReplyTracker>,
    listener: Arc<dyn ChannelListener>,
    /// version stamped on locally created indexed channels; a restarted process must get a
    ///  *higher* version than its previous life, or peers would discard its packets as stale
    channel_version: u32,
}

/// wall-clock seconds, so each process restart yields a strictly newer channel version
fn current_channel_version() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_secs() as u32)
        .unwrap_or(0)
}

impl NetworkInterface {
    pub async fn bind(
        bind_addr: SocketAddr,
        config: TransportConfig,
        mut table: DescriptorTable,
        default_options: ChannelOptions,
        listener: Arc<dyn ChannelListener>,
    ) -> anyhow::Result<Arc<NetworkInterface>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        // observe write readiness once - until then try_send_to reports WouldBlock and the
        //  very first outgoing packet would be dropped
        socket.writable().await?;
        let local_addr = socket.local_addr()?;
        info!("bound network interface on {}", local_addr);

        let replies = Arc::new(ReplyTracker::default());
        table.register_reply(Arc::new(ReplyHandler { tracker: replies.clone() }));

        let pipeline = Arc::new(SendPipeline::new(
            socket.clone() as Arc<dyn SendSocket>,
            local_addr,
        ));

        Ok(Arc::new(NetworkInterface {
            socket,
            pipeline,
            config: Arc::new(config),
            table: Arc::new(table),
            default_options,
            channels: Mutex::new(FxHashMap::default()),
            replies,
            listener,
            channel_version: current_channel_version(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.pipeline.local_addr()
    }

    /// Hook this interface into a dispatcher: its socket, its per-tick flush, and (if
    ///  configured) its channel inactivity sweep.
    pub fn attach_to(self: &Arc<Self>, dispatcher: &mut EventDispatcher) {
        dispatcher.register_socket(self.socket.clone(), self.clone() as Arc<dyn InputHandler>);

        let weak = Arc::downgrade(self);
        dispatcher.add_frequent_task(move |timers| {
            if let Some(interface) = weak.upgrade() {
                interface.flush_all(timers);
            }
        });

        if let Some(timeout) = self.config.channel_inactivity_timeout {
            let period = (timeout / 4).max(Duration::from_millis(100));
            let weak = Arc::downgrade(self);
            let scheduled = dispatcher.timers().schedule(
                Instant::now() + period,
                Some(period),
                TimerEvent::new(move |timers, handle| {
                    match weak.upgrade() {
                        Some(interface) => interface.sweep_inactive(timeout),
                        None => {
                            timers.cancel(handle);
                        }
                    }
                }),
            );
            if let Err(e) = scheduled {
                warn!("could not schedule the channel inactivity sweep: {:#}", e);
            }
        }
    }

    /// Buffer a message to `peer`, creating the channel if necessary. It goes out with the
    ///  next tick's flush.
    pub fn send(
        &self,
        timers: &mut Timers,
        peer: SocketAddr,
        index: Option<u16>,
        message_id: u8,
        payload: &[u8],
        reliable: bool,
    ) -> anyhow::Result<()> {
        let channel = self.channel_for_send(peer, index)?;
        channel.send_message(timers, Instant::now(), message_id, None, payload, reliable)
    }

    /// Send a request message and get a ticket to wait for its reply with.
    pub fn send_request(
        &self,
        timers: &mut Timers,
        peer: SocketAddr,
        index: Option<u16>,
        message_id: u8,
        payload: &[u8],
    ) -> anyhow::Result<ReplyTicket> {
        let ticket = self.replies.begin();
        let channel = self.channel_for_send(peer, index)?;
        if let Err(e) = channel.send_message(timers, Instant::now(), message_id, Some(ticket.id), payload, true) {
            self.replies.abandon(ticket.id);
            return Err(e);
        }
        Ok(ticket)
    }

    /// Answer a request, correlating by the reply id its handler got in [MessageSource].
    pub fn send_reply(
        &self,
        timers: &mut Timers,
        peer: SocketAddr,
        index: Option<u16>,
        reply_id: u32,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let channel = self.channel_for_send(peer, index)?;
        channel.send_message(timers, Instant::now(), REPLY_MESSAGE_ID, Some(reply_id), payload, true)
    }

    /// Block on a reply by driving the dispatcher until it arrives or `timeout` passes.
    ///  This keeps all other traffic flowing while waiting.
    pub async fn wait_for_reply(
        &self,
        dispatcher: &mut EventDispatcher,
        ticket: ReplyTicket,
        timeout: Duration,
    ) -> anyhow::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.replies.try_take(ticket.id) {
                return Ok(payload);
            }
            let now = Instant::now();
            if now >= deadline {
                self.replies.abandon(ticket.id);
                bail!("timed out waiting for a reply after {:?}", timeout);
            }
            dispatcher.tick(deadline - now).await;
        }
    }

    /// Begin an orderly shutdown of the channel to `peer`: it drains its outstanding data,
    ///  then goes away.
    pub fn condemn_channel(&self, timers: &mut Timers, peer: SocketAddr, index: Option<u16>) {
        let channel = self.lock_channels().get(&(peer, index)).cloned();
        if let Some(channel) = channel {
            channel.condemn(timers, Instant::now());
        }
    }

    /// Re-point an existing channel at a new peer address, keeping all of its state.
    pub fn switch_channel_address(
        &self,
        peer: SocketAddr,
        index: Option<u16>,
        new_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let mut channels = self.lock_channels();
        let Some(channel) = channels.remove(&(peer, index)) else {
            bail!("no channel to {} to switch", peer);
        };
        channel.switch_address(new_addr);
        channels.insert((new_addr, index), channel);
        Ok(())
    }

    pub fn channel_stats(&self, peer: SocketAddr, index: Option<u16>) -> Option<ChannelStats> {
        self.lock_channels().get(&(peer, index)).map(|channel| channel.stats())
    }

    fn lock_channels(&self) -> MutexGuard<'_, FxHashMap<ChannelKey, Channel>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn channel_for_send(&self, peer: SocketAddr, index: Option<u16>) -> anyhow::Result<Channel> {
        let mut channels = self.lock_channels();
        let key = (peer, index);
        if let Some(channel) = channels.get(&key) {
            if channel.state() != ChannelState::Destroyed {
                return Ok(channel.clone());
            }
            channels.remove(&key);
        }

        let indexed = index.map(|id| IndexedChannelId { id, version: self.channel_version });
        let channel = Channel::new(
            self.config.clone(),
            self.default_options,
            peer,
            indexed,
            true,
            self.pipeline.clone(),
            self.table.clone(),
        );
        debug!("created channel to {} (index {:?})", peer, index);
        channels.insert(key, channel.clone());
        Ok(channel)
    }

    /// Find the channel an incoming packet belongs to, adopting an anonymous auto-switch
    ///  channel or creating a fresh one as needed.
    fn lookup_or_create(&self, key: ChannelKey, header: &PacketHeader, from: SocketAddr) -> Channel {
        let mut channels = self.lock_channels();
        if let Some(channel) = channels.get(&key) {
            return channel.clone();
        }

        // a channel waiting for its first sender claims the packet, and with it the key
        let adoptable = channels.iter()
            .find(|((_, index), channel)| {
                *index == key.1
                    && channel.state() == ChannelState::Anonymous
                    && channel.auto_switches_to_first_sender()
            })
            .map(|(old_key, channel)| (*old_key, channel.clone()));
        if let Some((old_key, channel)) = adoptable {
            debug!("channel keyed {:?} adopts first sender {}", old_key, from);
            channels.remove(&old_key);
            channels.insert(key, channel.clone());
            return channel;
        }

        debug!("creating channel for {} on first packet (create flag: {})", from, header.create_channel);
        let channel = Channel::new(
            self.config.clone(),
            self.default_options,
            from,
            header.indexed,
            false,
            self.pipeline.clone(),
            self.table.clone(),
        );
        channels.insert(key, channel.clone());
        channel
    }

    fn flush_all(&self, timers: &mut Timers) {
        let now = Instant::now();
        let channels: Vec<(ChannelKey, Channel)> = self.lock_channels().iter()
            .map(|(key, channel)| (*key, channel.clone()))
            .collect();

        for (key, channel) in channels {
            channel.flush(timers, now);
            if channel.state() == ChannelState::Destroyed {
                self.remove_channel(key);
            }
        }
    }

    fn sweep_inactive(&self, timeout: Duration) {
        let now = Instant::now();
        self.replies.expire(now, timeout);

        let stale: Vec<ChannelKey> = self.lock_channels().iter()
            .filter(|(_, channel)| {
                channel.state() == ChannelState::Destroyed
                    || now.duration_since(channel.last_received_at()) > timeout
            })
            .map(|(key, _)| *key)
            .collect();

        for key in stale {
            debug!("dropping channel {:?}: inactive or drained", key);
            self.remove_channel(key);
        }
    }

    fn remove_channel(&self, key: ChannelKey) {
        if self.lock_channels().remove(&key).is_some() {
            self.listener.on_channel_lost(key.0, key.1);
        }
    }

    fn dispatch_message(&self, timers: &mut Timers, from: SocketAddr, index: Option<u16>, message: DecodedMessage) {
        // the descriptor must exist - decoding resolved it from the same table
        let Some(descriptor) = self.table.get(message.id) else {
            return;
        };
        let handler = descriptor.handler.clone();
        let source = MessageSource {
            peer_addr: from,
            channel_index: index,
            reply_id: message.reply_id,
        };
        handler.on_message(timers, &source, &message.payload);
    }
}

impl InputHandler for NetworkInterface {
    fn on_datagram(&self, timers: &mut Timers, from: SocketAddr, data: &[u8]) {
        let now = Instant::now();

        let mut buf = data;
        let header = match PacketHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping malformed packet from {}: {:#}", from, e);
                return;
            }
        };
        let body = buf;

        let index = header.indexed.map(|indexed| indexed.id);
        let key = (from, index);
        let channel = self.lookup_or_create(key, &header, from);

        let outcome = channel.on_packet(timers, now, &header, body, from);

        // lifecycle and message dispatch happen with the channel lock long released, so
        //  handlers are free to send
        if outcome.established {
            self.listener.on_channel_established(from, index);
        }
        for message in outcome.messages {
            self.dispatch_message(timers, from, index, message);
        }
        if outcome.destroyed {
            self.remove_channel(key);
        }
    }
}

/// Correlates outgoing requests with the replies that answer them. Slots whose ticket is
///  dropped without ever being awaited are expired by the interface's inactivity sweep, so
///  the map cannot grow without bound.
#[derive(Default)]
pub struct ReplyTracker {
    slots: Mutex<FxHashMap<u32, ReplySlot>>,
    next_id: AtomicU32,
}

struct ReplySlot {
    requested_at: Instant,
    payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplyTicket {
    id: u32,
}

impl ReplyTracker {
    fn lock_slots(&self) -> MutexGuard<'_, FxHashMap<u32, ReplySlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self) -> ReplyTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_slots().insert(id, ReplySlot {
            requested_at: Instant::now(),
            payload: None,
        });
        ReplyTicket { id }
    }

    fn resolve(&self, id: u32, payload: Vec<u8>) {
        match self.lock_slots().get_mut(&id) {
            Some(slot) => slot.payload = Some(payload),
            None => warn!("ignoring unsolicited or late reply with id {}", id),
        }
    }

    fn try_take(&self, id: u32) -> Option<Vec<u8>> {
        let mut slots = self.lock_slots();
        let ready = matches!(slots.get(&id), Some(slot) if slot.payload.is_some());
        if ready {
            return slots.remove(&id).and_then(|slot| slot.payload);
        }
        // an actively polled slot is not abandoned - keep it out of the expiry's reach
        if let Some(slot) = slots.get_mut(&id) {
            slot.requested_at = Instant::now();
        }
        None
    }

    fn abandon(&self, id: u32) {
        self.lock_slots().remove(&id);
    }

    /// drop slots nobody has polled for longer than `timeout`
    fn expire(&self, now: Instant, timeout: Duration) {
        let mut slots = self.lock_slots();
        let before = slots.len();
        slots.retain(|_, slot| now.duration_since(slot.requested_at) <= timeout);
        if slots.len() < before {
            debug!("expired {} abandoned reply slots", before - slots.len());
        }
    }
}

/// the handler behind the built-in reply message id
struct ReplyHandler {
    tracker: Arc<ReplyTracker>,
}

impl MessageHandler for ReplyHandler {
    fn on_message(&self, _timers: &mut Timers, source: &MessageSource, payload: &[u8]) {
        match source.reply_id {
            Some(reply_id) => self.tracker.resolve(reply_id, payload.to_vec()),
            None => warn!("reply message from {} without a correlation id", source.peer_addr),
        }
    }
}
