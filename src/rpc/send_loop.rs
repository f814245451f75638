//! Single-writer outbound path for a connection
//!
//! Producers enqueue complete frames through `Outbound`; one task drains the queue and is the
//! only writer to the underlying stream.

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Producer handle. Cloning is cheap; the loop ends once every handle is dropped.
#[derive(Clone)]
pub struct Outbound {
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl Outbound {
    /// Queues a frame. Returns `false` once the loop has stopped.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        self.sender.send(frame).is_ok()
    }
}

pub struct SendLoop {
    outbound: Outbound,
    handle: JoinHandle<()>,
}

impl SendLoop {
    /// Spawns the writer task. A failed write cancels `closed` so the reading side can stop.
    pub fn spawn<W>(mut writer: W, closed: CancellationToken) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();

        let handle = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                let written = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await
                }
                .await;

                if let Err(err) = written {
                    debug!(error = %err, "write failed, closing connection");
                    closed.cancel();
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            outbound: Outbound { sender },
            handle,
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Drops this loop's own producer handle and waits for queued frames to drain.
    pub async fn finish(self) {
        drop(self.outbound);
        let _ = self.handle.await;
    }
}
