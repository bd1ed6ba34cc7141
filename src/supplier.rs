// ABOUTME: Ingestion side of the relay: reads the single input stream into pool frames
// ABOUTME: Serves one supplier connection at a time and publishes filled frames to the fan-out

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::net::{RelayListener, RelayStream};
use crate::pool::{Frame, FramePool};

/// Pause before retrying a failed accept, so transient failures such as
/// hitting the descriptor limit do not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Reads bytes from the single active input connection into pool frames and
/// publishes each filled frame to the shared fan-out channel.
///
/// Only one supplier connection is ever served at a time; the stream has a
/// single writer by construction, and interleaving two inputs would scramble
/// the byte order every consumer observes. Additional suppliers wait in the
/// accept backlog.
pub struct Supplier {
    listener: RelayListener,
    pool: FramePool,
    frames: mpsc::Sender<Frame>,
}

impl Supplier {
    pub fn new(listener: RelayListener, pool: FramePool, frames: mpsc::Sender<Frame>) -> Self {
        Self {
            listener,
            pool,
            frames,
        }
    }

    /// Accept supplier connections until shutdown, serving each to
    /// completion before accepting the next.
    ///
    /// Supplier-side failures end the current session and never propagate to
    /// consumers; they observe a gap-free suffix of whatever bytes were read.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (conn, addr) = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "failed to accept input stream supplier");
                        sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            info!(supplier = %addr, "serving input stream supplier");
            self.pump(conn, &mut shutdown).await;
            info!(supplier = %addr, "disconnecting input stream supplier");

            if *shutdown.borrow() {
                return;
            }
        }
    }

    /// Relay one connection: acquire a frame, fill it with a single read,
    /// publish, repeat until end-of-stream, error, or shutdown.
    async fn pump(&self, mut conn: RelayStream, shutdown: &mut watch::Receiver<bool>) {
        loop {
            let mut frame = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                acquired = self.pool.acquire() => match acquired {
                    Some(frame) => frame,
                    // Pool closed: the relay is tearing down.
                    None => return,
                },
            };

            let read = {
                let buf = frame.data_mut();
                tokio::select! {
                    read = conn.read(buf) => Some(read),
                    _ = shutdown.changed() => None,
                }
            };
            let n = match read {
                // Shutdown fired mid-read: close the connection and bail.
                None => {
                    frame.adjust_uses(-1);
                    return;
                }
                // End of stream: the supplier is done, wait for the next one.
                Some(Ok(0)) => {
                    frame.adjust_uses(-1);
                    return;
                }
                Some(Ok(n)) => n,
                Some(Err(err)) => {
                    warn!(%err, "error while reading the input stream");
                    frame.adjust_uses(-1);
                    return;
                }
            };
            frame.set_filled(n);

            // Reserve the channel slot first, then move the frame into it:
            // the supplier's one use travels with the handle, and the frame
            // stays in hand for release if the dispatcher is gone or shutdown
            // wins the race.
            tokio::select! {
                biased;
                reserved = self.frames.reserve() => match reserved {
                    Ok(permit) => permit.send(frame),
                    // Dispatcher is gone; nothing downstream will release
                    // this frame.
                    Err(_) => {
                        frame.adjust_uses(-1);
                        return;
                    }
                },
                _ = shutdown.changed() => {
                    frame.adjust_uses(-1);
                    return;
                }
            }
        }
    }
}
