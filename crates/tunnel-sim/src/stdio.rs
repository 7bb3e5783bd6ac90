//! Hosts a [`Worker`] behind a pair of byte streams.
//!
//! This is the worker half of the process transport: a worker binary calls
//! [`serve`] with its stdin and stdout and the host talks to it through
//! `tunnel_client::ProcessTransport`.

use crate::simulated::deliver;
use crate::{Delivery, LifecycleAdapter, LifecycleError, Router, StopReason, Worker};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tunnel_core::{Frame, Handshake, StartOptions, StatusCell};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("worker channel i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot encode frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Start `worker`, answer one frame per input line, and stop it at end of input.
///
/// The first line written is a [`Handshake`]: `ready` once the worker has
/// started, or `failed` with the lifecycle error, after which `serve` returns
/// that error without reading any input. Every input line produces exactly one output line, even when the input is
/// malformed or the worker has nothing to say, so the host can match replies
/// to requests by order.
pub async fn serve<R, W>(
    worker: Arc<dyn Worker>,
    user_config: Option<Vec<u8>>,
    delivery: Delivery,
    options: StartOptions,
    reader: R,
    mut writer: W,
) -> Result<(), ServeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let status = StatusCell::new();
    let lifecycle = LifecycleAdapter::new(worker.clone(), Arc::new(Router::new()), user_config);
    if let Err(err) = lifecycle.start(&status, &options).await {
        let handshake = Handshake::Failed {
            error: err.to_string(),
        };
        writer.write_all(handshake.to_line()?.as_bytes()).await?;
        writer.flush().await?;
        return Err(err.into());
    }
    writer.write_all(Handshake::Ready.to_line()?.as_bytes()).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    let mut handled = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match Frame::from_line(&line) {
            Ok(Frame { body: Some(body) }) => {
                deliver(worker.as_ref(), lifecycle.router(), delivery, body).await
            }
            Ok(Frame { body: None }) => None,
            Err(err) => {
                tracing::warn!(error = %err, "malformed frame from host");
                None
            }
        };
        handled += 1;

        writer.write_all(Frame::new(reply).to_line()?.as_bytes()).await?;
        writer.flush().await?;
    }

    tracing::info!(handled, "host closed the channel");
    lifecycle.stop(&status, StopReason::HostShutdown).await;
    Ok(())
}
