//! Outbound queue and the per-endpoint I/O loop.
//!
//! Every endpoint owns one named thread running a compio runtime. That
//! thread is the only one that touches the socket: callers enqueue, the loop
//! dequeues and writes, and inbound frames are decoded and dispatched on the
//! loop as well.
//!
//! ```text
//! caller threads ──enqueue──► OutboundQueue ──┐
//!                                             ▼
//!                 control ──────────────► [ I/O loop ] ◄──── socket readers
//!                 shutdown ─────────────►     │
//!                                             ▼
//!                                   hub / mailboxes / events
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::{select, FutureExt};
use lettuce_core::error::{LettuceError, Result};
use lettuce_core::monitor::{EndpointEvent, EventBus};
use lettuce_core::options::EndpointOptions;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Unbounded FIFO of items waiting for the I/O loop.
///
/// `enqueue` never blocks and never touches the socket.
pub struct OutboundQueue<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
}

impl<T> Default for OutboundQueue<T> {
    fn default() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }
}

impl<T> OutboundQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: T) {
        // Both halves live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(item);
    }

    /// Take the next item, waiting at most `timeout`.
    ///
    /// `Ok(None)` means the timeout expired with nothing to take. The loop
    /// decides whether that is an idle tick or a reported `QueueTimeout`.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<T>> {
        match compio::time::timeout(timeout, self.rx.recv_async()).await {
            Ok(Ok(item)) => Ok(Some(item)),
            Ok(Err(_)) => Err(LettuceError::Closed),
            Err(_elapsed) => Ok(self.rx.try_recv().ok()),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drop every queued item, returning how many there were.
    pub fn drain(&self) -> usize {
        self.rx.drain().count()
    }
}

impl<T> fmt::Debug for OutboundQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len())
            .finish()
    }
}

/// Endpoint lifecycle. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LoopState {
    Created = 0,
    Running = 1,
    Stopped = 2,
    Disposed = 3,
}

impl LoopState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Disposed,
        }
    }
}

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move forward to `next`; never moves back.
    fn advance(&self, next: LoopState) {
        self.0.fetch_max(next as u8, Ordering::AcqRel);
    }
}

/// Shared, read-only loop settings plus failure reporting.
pub(crate) struct LoopContext {
    /// Log prefix, e.g. `[SERVER]`.
    pub tag: &'static str,
    pub options: EndpointOptions,
    pub events: Arc<EventBus>,
}

impl LoopContext {
    /// Log and publish a failure.
    ///
    /// Returns the error back when the failure policy makes it fatal to the
    /// loop.
    pub fn report(&self, err: LettuceError) -> Result<()> {
        let fatal = self.options.failure_policy.is_strict()
            && matches!(
                err,
                LettuceError::QueueTimeout(_)
                    | LettuceError::SendTimeout { .. }
                    | LettuceError::UnknownRecipient(_)
            );

        if fatal {
            error!("{} Fatal under strict policy: {}", self.tag, err);
            return Err(err);
        }

        warn!("{} {}", self.tag, err);
        self.events.emit_failure(err);
        Ok(())
    }

    /// Map a socket write error to the endpoint taxonomy.
    pub fn send_error(&self, target: &str, err: io::Error) -> LettuceError {
        if lettuce_core::timeout::is_timeout(&err) {
            LettuceError::SendTimeout {
                target: target.to_string(),
                after: self.options.send_timeout,
            }
        } else {
            LettuceError::Io(err)
        }
    }
}

/// Topology-specific half of the loop. Lives on the loop thread only.
#[async_trait(?Send)]
pub(crate) trait LoopDriver {
    /// What callers enqueue.
    type Item: Send + 'static;
    /// Caller requests answered on the loop thread.
    type Control: Send + 'static;

    /// Next inbound message; `Ok(None)` when only connection state changed.
    /// Must be cancel-safe.
    async fn recv(&mut self) -> io::Result<Option<Vec<Bytes>>>;

    /// Decode and dispatch one inbound message.
    fn on_inbound(&mut self, frames: Vec<Bytes>, cx: &LoopContext) -> Result<()>;

    /// Encode and write one dequeued item within the send timeout.
    async fn on_outbound(&mut self, item: Self::Item, cx: &LoopContext) -> Result<()>;

    fn on_control(&mut self, command: Self::Control, cx: &LoopContext);

    /// Called after connection changes and idle ticks.
    async fn on_idle(&mut self, _cx: &LoopContext) -> Result<()> {
        Ok(())
    }
}

enum Step<I, C> {
    Stop,
    Control(C),
    Outbound(Result<Option<I>>),
    Inbound(io::Result<Option<Vec<Bytes>>>),
}

async fn run_loop<D: LoopDriver>(
    driver: &mut D,
    cx: &LoopContext,
    queue: &OutboundQueue<D::Item>,
    control: &flume::Receiver<D::Control>,
    stop: &flume::Receiver<()>,
) -> Result<()> {
    loop {
        let step = select! {
            _ = stop.recv_async().fuse() => Step::Stop,
            cmd = control.recv_async().fuse() => cmd.map_or(Step::Stop, Step::Control),
            item = queue.dequeue(cx.options.dequeue_timeout).fuse() => Step::Outbound(item),
            inbound = driver.recv().fuse() => Step::Inbound(inbound),
        };

        match step {
            Step::Stop => return Ok(()),
            Step::Control(command) => driver.on_control(command, cx),
            Step::Outbound(Ok(Some(item))) => {
                if let Err(e) = driver.on_outbound(item, cx).await {
                    cx.report(e)?;
                }
            }
            Step::Outbound(Ok(None)) => {
                if cx.options.report_queue_timeouts {
                    cx.report(LettuceError::QueueTimeout(cx.options.dequeue_timeout))?;
                } else {
                    trace!("{} Idle tick", cx.tag);
                }
                if let Err(e) = driver.on_idle(cx).await {
                    cx.report(e)?;
                }
            }
            Step::Outbound(Err(e)) => cx.report(e)?,
            Step::Inbound(Ok(Some(frames))) => {
                if let Err(e) = driver.on_inbound(frames, cx) {
                    cx.report(e)?;
                }
            }
            Step::Inbound(Ok(None)) => {
                if let Err(e) = driver.on_idle(cx).await {
                    cx.report(e)?;
                }
            }
            Step::Inbound(Err(e)) => return Err(LettuceError::Io(e)),
        }
    }
}

/// Owner of an endpoint's loop thread.
///
/// `shutdown` is idempotent and runs from `close()` and `Drop` alike. Items
/// still queued at shutdown are abandoned, not flushed.
pub(crate) struct IoThread {
    tag: &'static str,
    state: Arc<StateCell>,
    stop: Mutex<Option<flume::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl IoThread {
    /// Start the loop thread and wait until `open` produced the socket.
    ///
    /// Bind, connect and handshake failures come back from here, after the
    /// thread has exited.
    pub fn spawn<D, Open, Fut>(
        thread_name: String,
        cx: LoopContext,
        queue: Arc<OutboundQueue<D::Item>>,
        control: flume::Receiver<D::Control>,
        open: Open,
    ) -> Result<Self>
    where
        D: LoopDriver + 'static,
        Open: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<D>> + 'static,
    {
        let tag = cx.tag;
        let state = Arc::new(StateCell::default());
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let (ready_tx, ready_rx) = flume::bounded::<io::Result<()>>(1);
        let thread_state = state.clone();

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let runtime = match compio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let mut driver = match open().await {
                        Ok(driver) => driver,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    thread_state.advance(LoopState::Running);
                    let _ = ready_tx.send(Ok(()));
                    debug!("{} I/O loop running", cx.tag);

                    let result = run_loop(&mut driver, &cx, &queue, &control, &stop_rx).await;
                    thread_state.advance(LoopState::Stopped);

                    let abandoned = queue.drain();
                    if abandoned > 0 {
                        info!("{} Abandoned {} queued messages", cx.tag, abandoned);
                    }

                    // Releases the socket; nothing else owns it.
                    drop(driver);
                    thread_state.advance(LoopState::Disposed);

                    if let Err(e) = result {
                        cx.events.emit_failure(e);
                    }
                    cx.events.emit(EndpointEvent::Stopped);
                    debug!("{} I/O loop stopped", cx.tag);
                });
            })
            .map_err(|e| LettuceError::construction(format!("failed to spawn I/O thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tag,
                state,
                stop: Mutex::new(Some(stop_tx)),
                thread_id: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(LettuceError::Io(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(LettuceError::construction("I/O thread exited during startup"))
            }
        }
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    /// Whether the caller is running on this endpoint's loop thread.
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop the loop and wait for the socket to be released.
    ///
    /// From the loop thread itself (a subscriber closing its own endpoint)
    /// this only signals; the loop finishes once the callback returns.
    pub fn shutdown(&self) {
        let Some(stop) = self.stop.lock().take() else {
            return;
        };
        self.state.advance(LoopState::Stopped);
        drop(stop);

        if self.is_loop_thread() {
            debug!("{} Shutdown requested from the I/O loop", self.tag);
            return;
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("{} I/O thread panicked", self.tag);
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn dequeue_is_fifo() {
        let queue = OutboundQueue::new();
        for i in 0..5 {
            queue.enqueue(i);
        }
        let mut seen = Vec::new();
        while let Some(i) = queue.dequeue(Duration::from_millis(10)).await.unwrap() {
            seen.push(i);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[compio::test]
    async fn empty_queue_is_an_idle_tick() {
        let queue: OutboundQueue<u8> = OutboundQueue::new();
        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap(), None);
    }

    #[test]
    fn drain_abandons_everything() {
        let queue = OutboundQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn state_only_moves_forward() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), LoopState::Created);
        cell.advance(LoopState::Disposed);
        cell.advance(LoopState::Running);
        assert_eq!(cell.get(), LoopState::Disposed);
    }

    #[test]
    fn strict_policy_makes_timeouts_fatal() {
        let recoverable = LoopContext {
            tag: "[TEST]",
            options: EndpointOptions::default(),
            events: Arc::new(EventBus::new()),
        };
        let monitor = recoverable.events.monitor();
        assert!(recoverable
            .report(LettuceError::QueueTimeout(Duration::from_secs(5)))
            .is_ok());
        assert!(matches!(
            monitor.try_recv().unwrap(),
            EndpointEvent::Failure(_)
        ));

        let strict = LoopContext {
            tag: "[TEST]",
            options: EndpointOptions::default().strict(),
            events: Arc::new(EventBus::new()),
        };
        assert!(strict
            .report(LettuceError::UnknownRecipient("ghost".into()))
            .is_err());
        // Decode failures stay local to one message under either policy.
        assert!(strict
            .report(LettuceError::Decode(lettuce_core::error::DecodeError::UnknownType(9)))
            .is_ok());
    }

    /// Never receives and never sends; only idle ticks reach it.
    struct SilentDriver {
        idle_ticks: Arc<std::sync::atomic::AtomicUsize>,
        // A dropped control sender would stop the loop.
        _control: flume::Sender<()>,
    }

    #[async_trait(?Send)]
    impl LoopDriver for SilentDriver {
        type Item = u8;
        type Control = ();

        async fn recv(&mut self) -> io::Result<Option<Vec<Bytes>>> {
            futures::future::pending().await
        }

        fn on_inbound(&mut self, _frames: Vec<Bytes>, _cx: &LoopContext) -> Result<()> {
            Ok(())
        }

        async fn on_outbound(&mut self, _item: u8, _cx: &LoopContext) -> Result<()> {
            Ok(())
        }

        fn on_control(&mut self, _command: (), _cx: &LoopContext) {}

        async fn on_idle(&mut self, _cx: &LoopContext) -> Result<()> {
            self.idle_ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn silent_loop(options: EndpointOptions) -> (IoThread, lettuce_core::monitor::EndpointMonitor, Arc<std::sync::atomic::AtomicUsize>) {
        let events = Arc::new(EventBus::new());
        let monitor = events.monitor();
        let idle_ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticks = idle_ticks.clone();
        let (control_tx, control_rx) = flume::unbounded::<()>();
        let cx = LoopContext {
            tag: "[TEST]",
            options,
            events,
        };
        let io = IoThread::spawn(
            "lettuce-test-silent".to_string(),
            cx,
            Arc::new(OutboundQueue::<u8>::new()),
            control_rx,
            move || async move {
                Ok::<_, io::Error>(SilentDriver {
                    idle_ticks: ticks,
                    _control: control_tx,
                })
            },
        )
        .unwrap();
        (io, monitor, idle_ticks)
    }

    fn quick() -> EndpointOptions {
        EndpointOptions::default()
            .with_dequeue_timeout(Duration::from_millis(20))
            .with_queue_timeout_reports(true)
    }

    #[test]
    fn silent_queue_is_idle_by_default() {
        let options = EndpointOptions::default().with_dequeue_timeout(Duration::from_millis(20));
        let (io, monitor, idle_ticks) = silent_loop(options);
        thread::sleep(Duration::from_millis(150));
        assert!(idle_ticks.load(Ordering::SeqCst) >= 2);
        assert!(monitor.try_recv().is_err());
        assert_eq!(io.state(), LoopState::Running);
    }

    #[test]
    fn reported_queue_timeout_is_a_recoverable_failure() {
        let (io, monitor, idle_ticks) = silent_loop(quick());
        let event = monitor.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, EndpointEvent::Failure(ref e) if matches!(**e, LettuceError::QueueTimeout(_))));
        assert_eq!(io.state(), LoopState::Running);

        // The tick still runs after the report.
        thread::sleep(Duration::from_millis(100));
        assert!(idle_ticks.load(Ordering::SeqCst) >= 1);
        io.shutdown();
        assert_eq!(io.state(), LoopState::Disposed);
    }

    #[test]
    fn reported_queue_timeout_stops_a_strict_loop() {
        let (io, monitor, _) = silent_loop(quick().strict());
        let event = monitor.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, EndpointEvent::Failure(ref e) if matches!(**e, LettuceError::QueueTimeout(_))));
        assert!(matches!(
            monitor.recv_timeout(Duration::from_secs(2)).unwrap(),
            EndpointEvent::Stopped
        ));
        assert_eq!(io.state(), LoopState::Disposed);
    }

    #[test]
    fn send_timeouts_are_classified() {
        let cx = LoopContext {
            tag: "[TEST]",
            options: EndpointOptions::default(),
            events: Arc::new(EventBus::new()),
        };
        let err = cx.send_error("alice", io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(err, LettuceError::SendTimeout { ref target, .. } if target == "alice"));
        let err = cx.send_error("alice", io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, LettuceError::Io(_)));
    }
}
