//! JSON-lines bridge between standard streams and the local bus.
//!
//! Every line is one [`StdioFrame`]. Input lines are published on the local
//! bus; messages on tapped channels are written back out in the same format.

use mqtt_bridge_bus::{BusError, LocalBus};
use mqtt_bridge_core::Message;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One line on stdin or stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioFrame {
    /// Local channel
    pub channel: String,
    /// Message body
    pub message: Message,
}

/// Publish every line of `reader` on the bus until EOF.
///
/// Blocking; run it on its own thread. Malformed lines are logged and
/// skipped. Returns the number of messages published.
///
/// # Errors
///
/// Returns error if reading fails.
pub fn pump_lines<R: BufRead>(reader: R, bus: &dyn LocalBus) -> std::io::Result<usize> {
    let mut published = 0;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let frame: StdioFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed input line");
                continue;
            }
        };

        match bus.publish(&frame.channel, frame.message) {
            Ok(()) => published += 1,
            Err(BusError::Closed) => break,
            Err(e) => tracing::warn!(channel = %frame.channel, error = %e, "Failed to publish input line"),
        }
    }

    tracing::debug!(published, "Input stream ended");
    Ok(published)
}

/// Write messages from `channels` to `writer`, one frame per line.
///
/// The returned task ends once every channel is closed.
///
/// # Errors
///
/// Returns error if a channel cannot be subscribed.
pub fn spawn_taps<W>(
    bus: &dyn LocalBus,
    channels: &[String],
    writer: W,
) -> Result<JoinHandle<()>, BusError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(100);

    for channel in channels {
        let mut subscription = bus.subscribe(channel)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let frame = StdioFrame {
                    channel: subscription.channel().to_string(),
                    message,
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }

    Ok(tokio::spawn(write_frames(rx, writer)))
}

async fn write_frames<W>(mut rx: mpsc::Receiver<StdioFrame>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(channel = %frame.channel, error = %e, "Failed to encode output frame");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await
        {
            tracing::error!(error = %e, "Failed to write output frame");
            break;
        }
    }
}
