//! Bidirectional multiplexed RPC endpoint
//!
//! One [`Endpoint`] exists per connection on each side. The protocol is
//! symmetric: either side may call methods the other side registered. Calls
//! are correlated by a per-endpoint monotonic 64-bit id; responses may come
//! back in any order, so thousands of calls can be in flight at once.
//!
//! Internally the endpoint keeps a method table, a pending-response map of
//! one-shot slots, a bounded outbound queue drained by a single writer task,
//! and a reader loop that routes incoming frames. Handlers run as
//! independent tasks; the reader never awaits them.

use crate::error::{Result, RpcError, METHOD_NOT_FOUND_PREFIX};
use protocol::{decode_payload, encode_payload, Frame, ProtocolError, WireDecode, WireEncode};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, warn};

/// Outbound frames queued towards the writer task. A full queue suspends the
/// enqueuing task, which is the only back-pressure in this layer.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Vec<u8>, String>> + Send>>;
type Handler = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

type ResponseSlot = oneshot::Sender<std::result::Result<Vec<u8>, String>>;

/// Aborts the writer task when the surrounding `run` future goes away, so a
/// cancelled endpoint releases its write half and the peer sees EOF.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One side of a framed bidirectional RPC connection.
pub struct Endpoint {
    methods: Mutex<HashMap<String, Handler>>,
    pending: Mutex<HashMap<u64, ResponseSlot>>,
    /// Correlation ids of calls the peer has in flight on us. A duplicate id
    /// means the peer is malformed and the connection is dropped.
    active_calls: Arc<Mutex<HashSet<u64>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    next_correlation: AtomicU64,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        Self {
            methods: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            active_calls: Arc::new(Mutex::new(HashSet::new())),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            next_correlation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// Register a handler for `method`.
    ///
    /// The handler receives the raw argument payload and produces either a
    /// result payload or an error text. Registering the same key twice is a
    /// programming error.
    ///
    /// # Panics
    ///
    /// Panics if `method` is already registered.
    pub fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<u8>, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| Box::pin(handler(args)));
        let previous = self
            .methods
            .lock()
            .expect("method table poisoned")
            .insert(method.to_string(), handler);
        assert!(
            previous.is_none(),
            "method {method:?} registered twice"
        );
    }

    /// Register a typed handler: arguments are decoded and the result encoded
    /// with the wire traits.
    pub fn register_fn<Args, R, F, Fut>(&self, method: &str, f: F)
    where
        Args: WireDecode + Send + 'static,
        R: WireEncode,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, String>> + Send + 'static,
    {
        self.register(method, move |payload: Vec<u8>| {
            let started = decode_payload::<Args>(&payload)
                .map(&f)
                .map_err(|e| format!("invalid arguments: {e}"));
            async move {
                match started {
                    Ok(fut) => fut.await.map(|result| encode_payload(&result)),
                    Err(e) => Err(e),
                }
            }
        });
    }

    /// Call `method` on the peer and suspend until its response arrives.
    pub async fn call<Args, R>(&self, method: &str, args: Args) -> Result<R>
    where
        Args: WireEncode,
        R: WireDecode,
    {
        let payload = self.call_raw(method, encode_payload(&args)).await?;
        decode_payload(&payload).map_err(RpcError::Transport)
    }

    /// Untyped variant of [`Endpoint::call`].
    pub async fn call_raw(&self, method: &str, args: Vec<u8>) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }

        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Call {
            method: method.to_string(),
            correlation_id,
            args,
        };
        let bytes = frame.encode()?;

        let (slot, response) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(correlation_id, slot);

        if self.outbound.send(bytes).await.is_err() {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&correlation_id);
            return Err(RpcError::ConnectionClosed);
        }

        match response.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(RpcError::from_remote_text(message)),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Drive the reader and writer over `stream` until the socket closes, a
    /// fatal framing error occurs, or [`Endpoint::close`] is called.
    ///
    /// Every pending call is failed with `ConnectionClosed` on the way out.
    ///
    /// # Panics
    ///
    /// Panics if called a second time on the same endpoint.
    pub async fn run<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .expect("outbound queue poisoned")
            .take()
            .expect("endpoint is already running");

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let writer = AbortOnDrop(tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("writer stopped: {e}");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        }));

        let result = tokio::select! {
            res = self.read_loop(&mut read_half) => res,
            _ = self.close_signal.notified() => Ok(()),
        };

        self.closed.store(true, Ordering::SeqCst);
        // Dropping the slots wakes every in-flight caller with ConnectionClosed.
        self.pending.lock().expect("pending map poisoned").clear();
        drop(writer);

        result
    }

    /// Initiate orderly shutdown. In-flight calls complete with
    /// `ConnectionClosed`; [`Endpoint::run`] returns.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.notify_one();
    }

    async fn read_loop<R>(&self, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match protocol::read_frame(reader).await? {
                Some(frame) => frame,
                None => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
            };

            match frame {
                Frame::Call {
                    method,
                    correlation_id,
                    args,
                } => self.dispatch_call(method, correlation_id, args)?,
                Frame::ResponseOk {
                    correlation_id,
                    result,
                } => self.complete(correlation_id, Ok(result))?,
                Frame::ResponseErr {
                    correlation_id,
                    message,
                } => self.complete(correlation_id, Err(message))?,
            }
        }
    }

    /// Route one incoming call to its handler task.
    ///
    /// The handler runs concurrently with the reader; its response frame is
    /// enqueued under the original correlation id when it finishes. A panic
    /// inside a handler is reported to the peer as a generic error and does
    /// not take the endpoint down.
    fn dispatch_call(&self, method: String, correlation_id: u64, args: Vec<u8>) -> Result<()> {
        {
            let mut active = self.active_calls.lock().expect("active set poisoned");
            if !active.insert(correlation_id) {
                return Err(RpcError::Transport(ProtocolError::MalformedFrame {
                    reason: "duplicate correlation id from peer",
                }));
            }
        }

        let handler = self
            .methods
            .lock()
            .expect("method table poisoned")
            .get(&method)
            .cloned();
        let outbound = self.outbound.clone();
        let active = Arc::clone(&self.active_calls);

        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => match tokio::spawn(handler.as_ref()(args)).await {
                    Ok(result) => result,
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!("handler for {method:?} panicked");
                        }
                        Err("internal error".to_string())
                    }
                },
                None => {
                    warn!("call for unknown method {method:?}");
                    Err(format!("{METHOD_NOT_FOUND_PREFIX}{method}"))
                }
            };

            active
                .lock()
                .expect("active set poisoned")
                .remove(&correlation_id);

            let frame = match outcome {
                Ok(result) => Frame::ResponseOk {
                    correlation_id,
                    result,
                },
                Err(message) => Frame::ResponseErr {
                    correlation_id,
                    message,
                },
            };
            let bytes = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => Frame::ResponseErr {
                    correlation_id,
                    message: e.to_string(),
                }
                .encode()
                .expect("error frame fits in a frame"),
            };
            // The peer may be gone by now; nothing to do about it here.
            let _ = outbound.send(bytes).await;
        });

        Ok(())
    }

    /// Fulfil the waiter of `correlation_id`, if it is still around.
    fn complete(
        &self,
        correlation_id: u64,
        outcome: std::result::Result<Vec<u8>, String>,
    ) -> Result<()> {
        match self
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&correlation_id)
        {
            Some(slot) => {
                // A dropped caller leaves its entry in the map until the
                // response arrives; the send fails and the response is
                // discarded, which is the documented detached behaviour.
                let _ = slot.send(outcome);
                Ok(())
            }
            None => Err(RpcError::Transport(ProtocolError::MalformedFrame {
                reason: "response for unknown correlation id",
            })),
        }
    }
}
