//! Native messaging host: length-prefixed JSON frames over stdio
//!
//! Each frame is a `u32` byte count in native byte order followed by that
//! many bytes of UTF-8 JSON. Every incoming envelope is forwarded to the
//! background context and answered with exactly one frame.

use crate::channel::{ContextHandle, ContextId};
use crate::error::ChatEmError;
use crate::router::Reply;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Largest frame the browser may send to a host
pub const MAX_INCOMING_FRAME: usize = 64 * 1024 * 1024;

/// Largest frame a host may send back to the browser
pub const MAX_OUTGOING_FRAME: usize = 1024 * 1024;

fn io_error(context: &str, err: std::io::Error) -> ChatEmError {
    ChatEmError::Channel(format!("{}: {}", context, err))
}

/// Reads one frame. `Ok(None)` means the browser closed the port.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ChatEmError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut len_buf).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(io_error("failed to read message length", err));
    }

    let len = u32::from_ne_bytes(len_buf) as usize;
    if len > MAX_INCOMING_FRAME {
        return Err(ChatEmError::Channel(format!(
            "incoming message of {} bytes exceeds the {} byte limit",
            len, MAX_INCOMING_FRAME
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| io_error("failed to read message payload", e))?;
    Ok(Some(payload))
}

/// Writes one frame. An oversized value fails with
/// [`ChatEmError::Validation`] before anything is written.
pub async fn write_frame<W>(writer: &mut W, value: &Value) -> Result<(), ChatEmError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(value).map_err(|e| ChatEmError::serialization("reply", e))?;
    if payload.len() > MAX_OUTGOING_FRAME {
        return Err(ChatEmError::Validation(format!(
            "reply of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_OUTGOING_FRAME
        )));
    }

    let len = (payload.len() as u32).to_ne_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| io_error("failed to write message length", e))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| io_error("failed to write message payload", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_error("failed to flush output", e))?;
    Ok(())
}

/// Serves one native messaging port until the browser closes it.
///
/// Frames are dispatched concurrently, so replies may be written in a
/// different order than the requests arrived; callers correlate them by
/// `requestId`.
pub async fn run_host<R, W>(reader: R, mut writer: W, handle: ContextHandle) -> Result<(), ChatEmError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    info!("[native] Host listening on stdio");
    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
    let reading = tokio::spawn(read_loop(reader, handle, tx));

    while let Some(reply) = rx.recv().await {
        let value = reply.to_value();
        match write_frame(&mut writer, &value).await {
            Ok(()) => {}
            Err(e @ ChatEmError::Validation(_)) => {
                warn!("[native] {}", e);
                let fallback = Reply::failure(&e).echo_request_id(&value);
                write_frame(&mut writer, &fallback.to_value()).await?;
            }
            Err(e) => return Err(e),
        }
    }

    let result = reading.await.map_err(|e| ChatEmError::Channel(e.to_string()))?;
    info!("[native] Port closed");
    result
}

async fn read_loop<R>(
    mut reader: R,
    handle: ContextHandle,
    replies: mpsc::UnboundedSender<Reply>,
) -> Result<(), ChatEmError>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = read_frame(&mut reader).await? {
        let envelope: Value = match serde_json::from_slice(&frame) {
            Ok(value) => value,
            Err(e) => {
                warn!("[native] Malformed frame: {}", e);
                let reply = Reply::failure(&ChatEmError::InvalidPayload(e.to_string()));
                if replies.send(reply).is_err() {
                    break;
                }
                continue;
            }
        };

        debug!("[native] Forwarding {}", envelope.get("action").unwrap_or(&Value::Null));
        let pending = handle.send(ContextId::Background, envelope.clone());
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = pending.wait().await.echo_request_id(&envelope);
            if replies.send(reply).is_err() {
                error!("[native] Output closed, reply dropped");
            }
        });
    }
    Ok(())
}
