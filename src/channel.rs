//! Typed message channels over a byte stream.
//!
//! A [`Channel`] owns a stream and runs two tasks over it. The outbound task drains a queue of
//! values, tagging each with its registered name and writing it as a frame. The inbound task
//! reads frames, rebuilds the registered type named by each tag, and publishes the value on the
//! inbound queue. Failures in either task are reported on a bounded error queue and do not stop
//! the task; only the end of the stream stops the inbound task, and only the closing of the
//! outbound queue stops the outbound task.
use std::{
    any::{type_name, Any, TypeId},
    fmt, io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use tokio::{
    io::{split, AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::{sleep, sleep_until, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    config::{Config, UnknownTypeAction, ViolationPolicy, ERROR_QUEUE_CAPACITY},
    error::{ChannelError, Result, WireError},
    frame::{decode_name, encode_frame, ValueReader},
    registry::Registry,
};

/// A value received from the peer, tagged with the name it was sent under.
///
/// The boxed value is the plain decoded type, so callers either match on [`Message::name`] or
/// try [`Message::downcast`] for each type they expect.
pub struct Message {
    name: Arc<str>,
    value: Box<dyn Any + Send>,
}

impl Message {
    /// The registered name the value arrived under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Takes the value out as a `T`, or gives the message back if it holds something else.
    pub fn downcast<T: Any>(self) -> std::result::Result<T, Message> {
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Message {
                name: self.name,
                value,
            }),
        }
    }

    /// Splits the message into its name and boxed value.
    pub fn into_parts(self) -> (Arc<str>, Box<dyn Any + Send>) {
        (self.name, self.value)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// State shared by the handles and both tasks of one channel.
struct Shared {
    registry: Arc<Registry>,
    closed: AtomicBool,
    /// Held for reading while a value is pushed onto the outbound queue, and for writing while
    /// the channel is marked closed.
    gate: RwLock<()>,
    shutdown: CancellationToken,
    violation: ViolationPolicy,
}

impl Shared {
    /// Starts shutdown. Returns false if the channel was already closed.
    fn close(&self) -> bool {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("closing channel");
        self.shutdown.cancel();
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The lossy producer side of the error queue.
#[derive(Clone)]
struct ErrorSink(mpsc::Sender<ChannelError>);

impl ErrorSink {
    /// Reports an error without ever blocking. When the queue is full the error is dropped.
    fn report(&self, err: ChannelError) {
        match self.0.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                warn!("error queue full, dropping error: {}", err);
            }
            Err(TrySendError::Closed(err)) => {
                trace!("error queue dropped, discarding error: {}", err);
            }
        }
    }
}

/// Outbound handle. Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<Box<dyn Any + Send>>,
    shared: Arc<Shared>,
}

impl Sender {
    /// Queues `value` for sending.
    ///
    /// Waits while the outbound queue is full. The value is written some time later, in the
    /// order it was queued; write failures show up on the error queue. A send that returns `Ok`
    /// was queued before the channel closed and is drained like any other queued value.
    ///
    /// Fails with [`ChannelError::UnregisteredType`] if `T` is not registered (or panics, under
    /// [`ViolationPolicy::Panic`]), and with [`ChannelError::Closed`] once `close()` has been
    /// called, including when a send waiting on a full queue is overtaken by the close.
    pub async fn send<T: Any + Send>(&self, value: T) -> Result<()> {
        if self
            .shared
            .registry
            .entry_for_type(TypeId::of::<T>())
            .is_none()
        {
            return Err(self.violation(type_name::<T>()));
        }
        self.enqueue(Box::new(value)).await
    }

    /// Queues an already boxed value, checking its runtime type against the registry.
    pub async fn send_boxed(&self, value: Box<dyn Any + Send>) -> Result<()> {
        if self.shared.registry.resolve_by_value(&*value).is_none() {
            return Err(self.violation("<boxed value>"));
        }
        self.enqueue(value).await
    }

    /// Closes the channel. See [`Channel::close`].
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    async fn enqueue(&self, value: Box<dyn Any + Send>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        let permit = self.tx.reserve().await.map_err(|_| ChannelError::Closed)?;
        // Once close() has returned, nothing more reaches the queue.
        let _gate = self
            .shared
            .gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }
        permit.send(value);
        Ok(())
    }

    fn violation(&self, type_name: &'static str) -> ChannelError {
        let err = ChannelError::UnregisteredType { type_name };
        error!("contract violation: {}", err);
        if self.shared.violation == ViolationPolicy::Panic {
            panic!("{}", err);
        }
        err
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

/// Inbound handle: decoded values in wire order.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::Receiver<Message>,
}

impl Inbound {
    /// Waits for the next value. Returns `None` once the stream has ended or the channel was
    /// closed, and every value received before that has been taken.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Takes the next value if one is ready.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Error handle: asynchronous send and receive failures.
///
/// The queue never closes, so [`Errors::recv`] waits forever when nothing goes wrong. Callers
/// usually race it against [`Inbound::recv`] or a timer.
#[derive(Debug)]
pub struct Errors {
    rx: mpsc::Receiver<ChannelError>,
    // Keeps the queue open after both tasks have finished.
    _open: mpsc::Sender<ChannelError>,
}

impl Errors {
    /// Waits for the next reported error.
    pub async fn recv(&mut self) -> ChannelError {
        match self.rx.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    /// Takes the next reported error if one is waiting.
    pub fn try_recv(&mut self) -> Option<ChannelError> {
        self.rx.try_recv().ok()
    }
}

/// A typed, bidirectional message channel over a byte stream.
///
/// The channel takes ownership of the stream; nothing else should read or write it. Only types
/// in the channel's [`Registry`] can be sent or received.
pub struct Channel {
    sender: Sender,
    inbound: Inbound,
    errors: Errors,
    outbound_task: JoinHandle<()>,
    inbound_task: JoinHandle<()>,
}

impl Channel {
    /// Wraps `stream`, with `capacity` slots in each of the outbound and inbound queues.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, capacity: usize, registry: impl Into<Arc<Registry>>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_config(stream, registry, Config::default().with_capacity(capacity))
    }

    /// Wraps `stream` with explicit settings.
    ///
    /// A registry shared through an `Arc` can back any number of channels.
    pub fn with_config<S>(stream: S, registry: impl Into<Arc<Registry>>, config: Config) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = config.capacity.max(1);
        let (read_half, write_half) = split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (error_tx, error_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);

        let shared = Arc::new(Shared {
            registry: registry.into(),
            closed: AtomicBool::new(false),
            gate: RwLock::new(()),
            shutdown: CancellationToken::new(),
            violation: config.violation,
        });
        trace!("starting channel: {:?}", shared.registry);

        let outbound_task = tokio::spawn(run_outbound(
            write_half,
            outbound_rx,
            shared.clone(),
            ErrorSink(error_tx.clone()),
            config.linger,
        ));
        let inbound_task = tokio::spawn(run_inbound(
            ValueReader::new(read_half),
            inbound_tx,
            shared.clone(),
            ErrorSink(error_tx.clone()),
            config.unknown_type,
        ));

        Self {
            sender: Sender {
                tx: outbound_tx,
                shared,
            },
            inbound: Inbound { rx: inbound_rx },
            errors: Errors {
                rx: error_rx,
                _open: error_tx,
            },
            outbound_task,
            inbound_task,
        }
    }

    /// A new handle onto the outbound queue.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Queues `value` for sending. See [`Sender::send`].
    pub async fn send<T: Any + Send>(&self, value: T) -> Result<()> {
        self.sender.send(value).await
    }

    /// Waits for the next received value. See [`Inbound::recv`].
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Waits for the next reported error. See [`Errors::recv`].
    pub async fn recv_error(&mut self) -> ChannelError {
        self.errors.recv().await
    }

    pub fn try_recv_error(&mut self) -> Option<ChannelError> {
        self.errors.try_recv()
    }

    /// The types this channel carries.
    pub fn registry(&self) -> &Registry {
        &self.sender.shared.registry
    }

    /// Shuts the channel down.
    ///
    /// The first call stops the inbound task, which closes the inbound queue, and closes the
    /// outbound queue to new values. Values already queued are still written, for up to
    /// [`Config::linger`], before the stream is shut down and released. Later calls do nothing.
    /// Safe to call concurrently from any number of handles.
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Separates the channel into its handles. The background tasks keep running.
    pub fn split(self) -> (Sender, Inbound, Errors) {
        (self.sender, self.inbound, self.errors)
    }

    /// Waits for both background tasks to finish, usually after [`Channel::close`].
    ///
    /// A panic in either task is resumed on the caller.
    pub async fn join(self) {
        let Self {
            sender,
            inbound,
            errors,
            outbound_task,
            inbound_task,
        } = self;
        // Our own handles must not keep the tasks alive.
        drop((sender, inbound, errors));
        for task in [outbound_task, inbound_task] {
            if let Err(e) = task.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                error!("channel task failed: {}", e);
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("registry", self.registry())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Drains the outbound queue onto the stream until the queue is closed and empty.
async fn run_outbound<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Box<dyn Any + Send>>,
    shared: Arc<Shared>,
    errors: ErrorSink,
    linger: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut deadline: Option<Instant> = None;
    let mut buf = Vec::new();
    loop {
        let value = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled(), if deadline.is_none() => {
                trace!("outbound queue closed, draining");
                rx.close();
                deadline = Some(Instant::now() + linger);
                continue;
            }
            value = rx.recv() => value,
        };
        let Some(value) = value else {
            break;
        };

        let Some(entry) = shared.registry.entry_for_value(&*value) else {
            // Senders check registration before queuing, so this is a broken invariant.
            let err = ChannelError::UnregisteredType {
                type_name: "<queued value>",
            };
            error!("contract violation in outbound task: {}", err);
            panic!("{}", err);
        };

        buf.clear();
        let encoded = encode_frame(&entry.name, entry.descriptor.as_ref(), &*value, &mut buf);
        let result = match encoded {
            Ok(()) => write_frame(&mut writer, &buf, deadline, &shared.shutdown, linger).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => trace!("sent {} ({} bytes)", entry.name, buf.len()),
            Err(e) => errors.report(ChannelError::Send(e)),
        }
    }

    let shutdown = async {
        match deadline {
            Some(deadline) => timeout_at(deadline, writer.shutdown())
                .await
                .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
            None => writer.shutdown().await,
        }
    };
    if let Err(e) = shutdown.await {
        debug!("error shutting down stream: {}", e);
    }
    trace!("outbound task finished");
}

/// Writes one encoded frame.
///
/// Gives up at `deadline` once the channel is draining. A write that was already blocked when
/// the channel closed gives up `linger` after the close.
async fn write_frame<W>(
    writer: &mut W,
    frame: &[u8],
    deadline: Option<Instant>,
    shutdown: &CancellationToken,
    linger: Duration,
) -> std::result::Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    let expired = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => {
                shutdown.cancelled().await;
                sleep(linger).await;
            }
        }
    };
    tokio::select! {
        written = write => written?,
        _ = expired => {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "close linger expired").into());
        }
    }
    Ok(())
}

/// Reads frames off the stream into the inbound queue until the stream ends or the channel is
/// closed. Dropping `tx` on return closes the inbound queue.
async fn run_inbound<R>(
    mut reader: ValueReader<R>,
    tx: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    errors: ErrorSink,
    unknown_type: UnknownTypeAction,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            frame = read_frame(&mut reader, &shared.registry, unknown_type) => frame,
        };
        let message = match frame {
            Ok(message) => message,
            Err(e) if e.is_closed() => {
                if let WireError::Truncated { .. } = e {
                    errors.report(ChannelError::Recv(e));
                } else {
                    debug!("stream closed: {}", e);
                }
                break;
            }
            Err(e @ WireError::UnknownType(_))
                if unknown_type == UnknownTypeAction::Disconnect =>
            {
                errors.report(ChannelError::Recv(e));
                break;
            }
            Err(e) => {
                errors.report(ChannelError::Recv(e));
                continue;
            }
        };

        trace!("received {}", message.name);
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            sent = tx.send(message) => {
                if sent.is_err() {
                    debug!("inbound handle dropped");
                    break;
                }
            }
        }
    }
    trace!("inbound task finished");
}

/// Reads one frame and decodes its payload into a fresh instance of the named type.
async fn read_frame<R>(
    reader: &mut ValueReader<R>,
    registry: &Registry,
    unknown_type: UnknownTypeAction,
) -> std::result::Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let name = decode_name(&reader.read_value().await?)?;
    let Some(entry) = registry.entry_by_name(&name) else {
        if unknown_type == UnknownTypeAction::Skip {
            reader.skip_value().await?;
        }
        return Err(WireError::UnknownType(name));
    };
    let payload = reader.read_value().await?;
    let mut instance = registry.new_instance(entry.descriptor.as_ref());
    entry.descriptor.decode_into(&payload, instance.as_mut())?;
    Ok(Message {
        name: entry.name.clone(),
        value: instance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(serde::Serialize, serde::Deserialize, Default, Debug, PartialEq)]
    struct Secret {
        code: u32,
    }

    fn registry(with_secret: bool) -> Registry {
        let mut registry = Registry::new();
        registry.register::<String>("greeting").unwrap();
        if with_secret {
            registry.register::<Secret>("secret").unwrap();
        }
        registry
    }

    #[test]
    fn test_message_downcast() {
        let message = Message {
            name: Arc::from("greeting"),
            value: Box::new(String::from("hi")),
        };
        assert_eq!(message.name(), "greeting");
        assert!(message.is::<String>());
        assert!(!message.is::<Secret>());
        assert_eq!(message.downcast_ref::<String>().map(String::as_str), Some("hi"));

        let message = message.downcast::<Secret>().unwrap_err();
        assert_eq!(message.downcast::<String>().unwrap(), "hi");
    }

    #[traced_test]
    #[test]
    fn test_error_sink_never_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ErrorSink(tx);
        sink.report(ChannelError::Closed);
        sink.report(ChannelError::Recv(WireError::ConnectionClosed));
        assert!(matches!(rx.try_recv(), Ok(ChannelError::Closed)));
        assert!(rx.try_recv().is_err());
        assert!(logs_contain("error queue full"));
    }

    #[tokio::test]
    async fn test_error_overflow_is_dropped() {
        let (a, b) = tokio::io::duplex(256);
        let a = Channel::new(a, 10, registry(true));
        let config = Config::default().with_unknown_type(UnknownTypeAction::Skip);
        let mut b = Channel::with_config(b, registry(false), config);

        let total = ERROR_QUEUE_CAPACITY + 50;
        for code in 0..total {
            a.send(Secret { code: code as u32 }).await.unwrap();
        }
        a.send(String::from("done")).await.unwrap();

        let message = timeout(WAIT, b.recv()).await.unwrap().unwrap();
        assert_eq!(message.downcast::<String>().unwrap(), "done");

        let mut reported = 0;
        while let Some(err) = b.try_recv_error() {
            assert!(matches!(
                err,
                ChannelError::Recv(WireError::UnknownType(ref n)) if n == "secret"
            ));
            reported += 1;
        }
        assert_eq!(reported, ERROR_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_blocked_write_gives_up_after_close() {
        // The far end is never read, so the second frame cannot fit.
        let (a, _far) = tokio::io::duplex(16);
        let config = Config::default().with_linger(Duration::from_millis(50));
        let a = Channel::with_config(a, registry(false), config);
        let (sender, _inbound, mut errors) = a.split();

        sender.send("x".repeat(64)).await.unwrap();
        sender.send("y".repeat(64)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.close();

        let err = timeout(WAIT, errors.recv()).await.unwrap();
        match err {
            ChannelError::Send(WireError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected a timed out send, got {:?}", other),
        }
    }
}
