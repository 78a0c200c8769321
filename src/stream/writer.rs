//! Input writer task.
//!
//! Receives already-terminated text from a tokio [`mpsc`] channel and writes
//! it to the agent's input. Callers append the newline that submits a line;
//! control input such as an interrupt (`\x03`) is written as-is.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Append the newline that submits `text` as one input line.
#[must_use]
pub fn input_line(text: &str) -> String {
    format!("{text}\n")
}

/// Input writer task: writes every received message to `input`.
///
/// The task drains queued messages and exits when all senders are dropped, so
/// a final message queued before the channel closes is still delivered.
/// `cancel` stops it immediately without draining.
///
/// # Errors
///
/// Returns [`AppError::Stream`] when a write fails (for example because the
/// agent process exited).
pub async fn run_writer<W>(
    session_id: String,
    mut input: W,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "input writer: cancellation received, stopping");
                break;
            }

            msg = rx.recv() => {
                let Some(text) = msg else {
                    debug!(session_id, "input writer: channel closed, stopping");
                    break;
                };
                let write = async {
                    input.write_all(text.as_bytes()).await?;
                    input.flush().await
                };
                write.await.map_err(|e| {
                    warn!(session_id, error = %e, "input writer: write failed");
                    AppError::Stream(format!("input write failed: {e}"))
                })?;
            }
        }
    }

    let _ = input.shutdown().await;
    Ok(())
}
