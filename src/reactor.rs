use crate::timer::{TimerHandle, TimerQueue};
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, span, Level};
use uuid::Uuid;

/// Callback payload of the shared timer queue. The callback gets the queue back so it can
///  schedule and cancel further timers, plus its own handle for self-identification.
pub struct TimerEvent(pub Box<dyn FnMut(&mut Timers, TimerHandle) + Send>);

pub type Timers = TimerQueue<TimerEvent>;

impl TimerEvent {
    pub fn new(callback: impl FnMut(&mut Timers, TimerHandle) + Send + 'static) -> TimerEvent {
        TimerEvent(Box::new(callback))
    }
}

/// Receiver of raw datagrams from a registered socket. Called synchronously on the
///  dispatcher's task; all protocol work happens inside this call.
pub trait InputHandler: Send + Sync + 'static {
    fn on_datagram(&self, timers: &mut Timers, from: SocketAddr, data: &[u8]);
}

struct Registration {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn InputHandler>,
}

const RECV_BUF_LEN: usize = 65536;
const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(50);

/// A cooperative, single-task event loop multiplexing socket input and timers.
///
/// One `tick` runs the frequent tasks, fires due timers, then waits for socket readiness -
///  but never longer than the earliest timer deadline (or the given ceiling), so timers stay
///  on time without a dedicated thread.
///
/// A dispatcher can adopt children: the parent's single wait covers the children's sockets
///  and timers too, which lets several protocol stacks share one loop.
pub struct EventDispatcher {
    timers: Timers,
    registrations: Vec<Registration>,
    frequent_tasks: Vec<Box<dyn FnMut(&mut Timers) + Send>>,
    children: Vec<EventDispatcher>,
    break_flag: Arc<AtomicBool>,
    recv_buf: Vec<u8>,
    max_wait: Duration,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> EventDispatcher {
        EventDispatcher {
            timers: TimerQueue::new(),
            registrations: Vec::new(),
            frequent_tasks: Vec::new(),
            children: Vec::new(),
            break_flag: Arc::new(AtomicBool::new(false)),
            recv_buf: vec![0; RECV_BUF_LEN],
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn with_max_wait(max_wait: Duration) -> EventDispatcher {
        EventDispatcher {
            max_wait,
            ..EventDispatcher::new()
        }
    }

    pub fn register_socket(&mut self, socket: Arc<UdpSocket>, handler: Arc<dyn InputHandler>) {
        self.registrations.push(Registration { socket, handler });
    }

    /// Run `task` at the start of every tick. Meant for cheap periodic work like flushing
    ///  outgoing bundles.
    pub fn add_frequent_task(&mut self, task: impl FnMut(&mut Timers) + Send + 'static) {
        self.frequent_tasks.push(Box::new(task));
    }

    /// Adopt `child`: from now on this dispatcher's wait and poll service the child's
    ///  sockets, timers and frequent tasks as well.
    pub fn attach_child(&mut self, child: EventDispatcher) {
        self.children.push(child);
    }

    pub fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    /// Setting this flag to `true` makes `process_continuously` return after the current
    ///  tick. Safe to do from any thread.
    pub fn break_flag(&self) -> Arc<AtomicBool> {
        self.break_flag.clone()
    }

    /// One pass of the event loop: frequent tasks, due timers, then a bounded wait for
    ///  socket input. Waits at most `ceiling` (and never longer than a pending timer needs).
    pub async fn tick(&mut self, ceiling: Duration) {
        self.run_frequent_tasks();

        let now = Instant::now();
        self.process_timers(now);

        let wait = self.calculate_wait(ceiling, now);
        if time::timeout(wait, self.wait_ready()).await.is_ok() {
            self.drain_ready();
        }
    }

    pub async fn process_continuously(&mut self) {
        info!("starting event loop");
        while !self.break_flag.load(Ordering::Relaxed) {
            self.tick(self.max_wait).await;
        }
        info!("event loop stopped");
    }

    /// like `process_continuously`, but additionally stops when `signal` becomes `true`
    pub async fn process_until_signalled(&mut self, signal: &AtomicBool) {
        while !signal.load(Ordering::Relaxed) && !self.break_flag.load(Ordering::Relaxed) {
            self.tick(self.max_wait).await;
        }
        debug!("event loop signalled to stop");
    }

    fn run_frequent_tasks(&mut self) {
        for task in &mut self.frequent_tasks {
            task(&mut self.timers);
        }
        for child in &mut self.children {
            child.run_frequent_tasks();
        }
    }

    fn process_timers(&mut self, now: Instant) {
        self.timers.process(now, |timers, handle, event| (event.0)(timers, handle));
        for child in &mut self.children {
            child.process_timers(now);
        }
    }

    /// minimum over the ceiling, this dispatcher's max wait, and every pending timer
    ///  deadline in this dispatcher and its children
    fn calculate_wait(&mut self, ceiling: Duration, now: Instant) -> Duration {
        let mut wait = ceiling.min(self.max_wait);
        if let Some(until_deadline) = self.timers.next_deadline(now) {
            wait = wait.min(until_deadline);
        }
        for child in &mut self.children {
            wait = wait.min(child.calculate_wait(ceiling, now));
        }
        wait
    }

    /// resolves as soon as any registered socket (children included) has input pending
    async fn wait_ready(&self) {
        poll_fn(|cx| {
            if self.poll_any_ready(cx) {
                Poll::Ready(())
            }
            else {
                Poll::Pending
            }
        }).await
    }

    fn poll_any_ready(&self, cx: &mut Context<'_>) -> bool {
        for registration in &self.registrations {
            if registration.socket.poll_recv_ready(cx).is_ready() {
                return true;
            }
        }
        self.children.iter().any(|child| child.poll_any_ready(cx))
    }

    fn drain_ready(&mut self) {
        for idx in 0..self.registrations.len() {
            loop {
                let received = {
                    let registration = &self.registrations[idx];
                    match registration.socket.try_recv_from(&mut self.recv_buf) {
                        Ok(received) => received,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!("error receiving datagram: {}", e);
                            break;
                        }
                    }
                };
                let (len, from) = received;
                let handler = self.registrations[idx].handler.clone();

                // correlation id to tie together all log lines caused by this datagram
                let span = span!(Level::TRACE, "recv", correlation = %Uuid::new_v4());
                let _entered = span.enter();
                handler.on_datagram(&mut self.timers, from, &self.recv_buf[..len]);
            }
        }
        for child in &mut self.children {
            child.drain_ready();
        }
    }
}
