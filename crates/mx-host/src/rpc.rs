//! The framed RPC channel between the kernel and a subprocess host.
//!
//! # Wire contract
//!
//! Messages travel over the child's standard I/O as frames of
//! `[u32 BE payload length][u8 flags][payload]`. A frame payload is at
//! most [`MAX_FRAME_PAYLOAD`] bytes; a message larger than one frame is
//! segmented into continuation frames (flag bit 0 set on every frame
//! except the last) and reassembled on the far side. A whole message is
//! bounded by the configured `max_call_bytes`; a request above that
//! bound is rejected with [`CallError::PayloadTooLarge`] before any
//! frame is written. Segmentation is explicit in this contract —
//! truncation never occurs.
//!
//! Requests are serialized [`CapabilityCall`]s; responses are
//! [`WireResponse`]s correlated by `call_id`, so a caller that timed
//! out or was cancelled leaves nothing ambiguous on the wire: the reply
//! router simply drops the late response.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use mx_core::{CallError, CallOutcome, CapabilityCall, PluginId};

/// Maximum payload bytes in a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Flag bit marking a frame as a continuation (more frames follow).
const FLAG_CONTINUATION: u8 = 0b0000_0001;

/// A response frame payload from a subprocess host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireResponse {
    /// The call succeeded.
    Ok {
        /// Correlates with the request's `call_id`.
        call_id: Uuid,
        /// The success payload.
        payload: serde_json::Value,
    },
    /// The call failed with a typed error.
    Err {
        /// Correlates with the request's `call_id`.
        call_id: Uuid,
        /// The typed failure.
        error: CallError,
    },
}

impl WireResponse {
    /// The correlation id of this response.
    #[must_use]
    pub const fn call_id(&self) -> Uuid {
        match self {
            Self::Ok { call_id, .. } | Self::Err { call_id, .. } => *call_id,
        }
    }

    /// Convert into a call outcome.
    #[must_use]
    pub fn into_outcome(self) -> CallOutcome {
        match self {
            Self::Ok { payload, .. } => Ok(payload),
            Self::Err { error, .. } => Err(error),
        }
    }
}

/// Write one message, segmenting into continuation frames as needed.
///
/// # Errors
///
/// Returns [`CallError::PayloadTooLarge`] if the message exceeds
/// `max_message_bytes` and [`CallError::Protocol`] on I/O failure.
pub async fn write_message<W>(
    writer: &mut W,
    bytes: &[u8],
    max_message_bytes: u64,
) -> Result<(), CallError>
where
    W: AsyncWrite + Unpin,
{
    let len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    if len > max_message_bytes {
        return Err(CallError::PayloadTooLarge {
            size: len,
            limit: max_message_bytes,
        });
    }

    let mut chunks = bytes.chunks(MAX_FRAME_PAYLOAD).peekable();
    // An empty message still produces one empty frame.
    if chunks.peek().is_none() {
        write_frame(writer, &[], 0).await?;
    }
    while let Some(chunk) = chunks.next() {
        let flags = if chunks.peek().is_some() {
            FLAG_CONTINUATION
        } else {
            0
        };
        write_frame(writer, chunk, flags).await?;
    }
    writer
        .flush()
        .await
        .map_err(|e| CallError::Protocol(format!("flush failed: {e}")))
}

async fn write_frame<W>(writer: &mut W, payload: &[u8], flags: u8) -> Result<(), CallError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| CallError::Protocol("frame payload exceeds u32".to_string()))?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| CallError::Protocol(format!("write failed: {e}")))?;
    writer
        .write_all(&[flags])
        .await
        .map_err(|e| CallError::Protocol(format!("write failed: {e}")))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| CallError::Protocol(format!("write failed: {e}")))?;
    Ok(())
}

/// Read one message, reassembling continuation frames.
///
/// Returns `None` on a clean end-of-stream before any frame.
///
/// # Errors
///
/// Returns [`CallError::Protocol`] on malformed frames or mid-message
/// stream loss, and [`CallError::PayloadTooLarge`] once the reassembled
/// message exceeds `max_message_bytes`.
pub async fn read_message<R>(
    reader: &mut R,
    max_message_bytes: u64,
) -> Result<Option<Vec<u8>>, CallError>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    let mut first = true;
    loop {
        let mut header = [0u8; 5];
        match reader.read_exact(&mut header).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && first => {
                return Ok(None);
            },
            Err(e) => {
                return Err(CallError::Protocol(format!("stream closed mid-message: {e}")));
            },
        }
        first = false;

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let flags = header[4];
        if len > MAX_FRAME_PAYLOAD {
            return Err(CallError::Protocol(format!(
                "frame payload of {len} bytes exceeds the {MAX_FRAME_PAYLOAD}-byte frame limit"
            )));
        }

        let total = u64::try_from(message.len().saturating_add(len)).unwrap_or(u64::MAX);
        if total > max_message_bytes {
            return Err(CallError::PayloadTooLarge {
                size: total,
                limit: max_message_bytes,
            });
        }

        let start = message.len();
        message.resize(start.saturating_add(len), 0);
        reader
            .read_exact(&mut message[start..])
            .await
            .map_err(|e| CallError::Protocol(format!("stream closed mid-frame: {e}")))?;

        if flags & FLAG_CONTINUATION == 0 {
            return Ok(Some(message));
        }
    }
}

type PendingMap = Mutex<HashMap<Uuid, (String, oneshot::Sender<CallOutcome>)>>;

/// A live request/response channel to one subprocess host.
///
/// Responses are routed back to callers by `call_id`, so concurrent or
/// abandoned calls cannot corrupt each other. The channel itself does
/// not serialize calls; the hosting runtime decides per-host
/// concurrency.
pub struct RpcChannel {
    plugin_id: PluginId,
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: Arc<PendingMap>,
    max_call_bytes: u64,
}

impl RpcChannel {
    /// Build a channel over arbitrary I/O halves and start its reply
    /// router.
    pub fn new<R, W>(plugin_id: PluginId, reader: R, writer: W, max_call_bytes: u64) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let channel = Self {
            plugin_id: plugin_id.clone(),
            writer: Arc::new(Mutex::new(Box::new(writer))),
            pending: Arc::clone(&pending),
            max_call_bytes,
        };
        tokio::spawn(reply_router(plugin_id, reader, pending, max_call_bytes));
        channel
    }

    /// Execute one call and await its response or timeout.
    ///
    /// On timeout the pending entry is withdrawn and the late response,
    /// if it ever arrives, is discarded by the router. Dropping the
    /// returned future abandons the call the same way without breaking
    /// the channel for later calls.
    pub async fn call(&self, call: CapabilityCall) -> CallOutcome {
        let capability = call.capability.clone();
        let call_id = call.call_id;
        let timeout = call.timeout();

        let bytes = serde_json::to_vec(&call)
            .map_err(|e| CallError::Protocol(format!("unserializable call: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(call_id, (capability.to_string(), tx));

        // The write runs in its own task so that cancelling this future
        // cannot tear a frame in half.
        let writer = Arc::clone(&self.writer);
        let max_call_bytes = self.max_call_bytes;
        let write_task = tokio::spawn(async move {
            let mut guard = writer.lock().await;
            write_message(&mut *guard, &bytes, max_call_bytes).await
        });

        match write_task.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                self.pending.lock().await.remove(&call_id);
                return Err(e);
            },
            Err(_) => {
                self.pending.lock().await.remove(&call_id);
                return Err(CallError::Protocol("writer task failed".to_string()));
            },
        }

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::Crashed {
                plugin_id: self.plugin_id.to_string(),
                capability: capability.to_string(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&call_id);
                Err(CallError::Timeout {
                    capability: capability.to_string(),
                    timeout_ms: call.timeout_ms,
                })
            },
        };

        // Caller-supplied response cap, tighter than the channel bound.
        if let (Ok(payload), Some(limit)) = (&outcome, call.max_response_bytes) {
            let size = serde_json::to_vec(payload)
                .map(|bytes| u64::try_from(bytes.len()).unwrap_or(u64::MAX))
                .unwrap_or(0);
            if size > limit {
                return Err(CallError::PayloadTooLarge { size, limit });
            }
        }
        outcome
    }

    /// Number of calls still awaiting a response.
    pub async fn pending_calls(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("plugin_id", &self.plugin_id)
            .field("max_call_bytes", &self.max_call_bytes)
            .finish_non_exhaustive()
    }
}

/// Read responses until the stream ends, routing each to its caller.
/// On stream loss, every pending call fails with `Crashed`.
async fn reply_router<R>(
    plugin_id: PluginId,
    mut reader: R,
    pending: Arc<PendingMap>,
    max_call_bytes: u64,
) where
    R: AsyncRead + Send + Unpin,
{
    loop {
        match read_message(&mut reader, max_call_bytes).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<WireResponse>(&bytes) {
                Ok(response) => {
                    let call_id = response.call_id();
                    if let Some((_, tx)) = pending.lock().await.remove(&call_id) {
                        let _ = tx.send(response.into_outcome());
                    } else {
                        debug!(plugin_id = %plugin_id, %call_id, "dropping late response");
                    }
                },
                Err(e) => {
                    warn!(plugin_id = %plugin_id, error = %e, "malformed response payload");
                },
            },
            Ok(None) => break,
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "response stream failed");
                break;
            },
        }
    }

    // Stream gone: fail whatever is still waiting.
    let mut pending = pending.lock().await;
    for (_, (capability, tx)) in pending.drain() {
        let _ = tx.send(Err(CallError::Crashed {
            plugin_id: plugin_id.to_string(),
            capability,
        }));
    }
}
