// ABOUTME: Fan-out side of the relay: peer membership, frame distribution, per-peer relay tasks
// ABOUTME: A single dispatcher task owns the live peer set; one relay task drains each peer's inbox

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::net::{RelayListener, RelayStream};
use crate::pool::Frame;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Capacity of the join channel. Joins are rare control events; the accept
/// loop parks on a full channel until the dispatcher catches up.
const JOIN_CHANNEL_CAPACITY: usize = 16;

/// One registered output consumer, as the dispatcher sees it.
///
/// Dropping the inbox sender is how the dispatcher closes a peer: the relay
/// drains whatever is still queued and exits.
struct Peer {
    seq: u64,
    inbox: mpsc::Sender<Frame>,
}

/// Accepts output stream consumers and distributes every published frame to
/// all of them.
///
/// Internally this is two tasks: a dispatcher owning the peer set, fed by
/// join/leave/frame events, and an accept loop registering new peers. Each
/// peer additionally gets a relay task writing its inbox to its socket.
pub struct Fanout {
    listener: RelayListener,
    frames: mpsc::Receiver<Frame>,
    inbox_capacity: usize,
    write_timeout: Option<Duration>,
}

impl Fanout {
    /// `inbox_capacity` should match the capacity of the shared `frames`
    /// channel: one sustained-slow consumer then backs pressure through the
    /// dispatcher into the supplier instead of dropping bytes silently.
    pub fn new(
        listener: RelayListener,
        frames: mpsc::Receiver<Frame>,
        inbox_capacity: usize,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            listener,
            frames,
            inbox_capacity,
            write_timeout,
        }
    }

    /// Run the fan-out until shutdown: dispatch published frames to every
    /// registered peer and keep the peer set current.
    pub async fn serve(self, shutdown: watch::Receiver<bool>) {
        let (joins_tx, joins_rx) = mpsc::channel(JOIN_CHANNEL_CAPACITY);
        // Leaves are best-effort and unbounded: a relay reporting a dead
        // consumer must never block, even against a dispatcher that has
        // already exited.
        let (leaves_tx, leaves_rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(dispatch(
            self.frames,
            joins_rx,
            leaves_rx,
            shutdown.clone(),
        ));

        accept_peers(
            self.listener,
            self.inbox_capacity,
            self.write_timeout,
            joins_tx,
            leaves_tx,
            shutdown,
        )
        .await;

        let _ = dispatcher.await;
    }
}

/// Dispatcher loop: one event at a time, no cross-event interleaving.
///
/// Joins are linearized against frame events here, which is what gives a new
/// consumer the "suffix of the stream starting at the join" contract: a peer
/// registered while a frame is being distributed only sees the next frame.
async fn dispatch(
    mut frames: mpsc::Receiver<Frame>,
    mut joins: mpsc::Receiver<Peer>,
    mut leaves: mpsc::UnboundedReceiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut peers: HashMap<u64, Peer> = HashMap::new();

    loop {
        tokio::select! {
            // Checked first so a fired shutdown wins over a backlog of events.
            biased;
            _ = shutdown.changed() => break,
            Some(peer) = joins.recv() => {
                debug!(consumer = peer.seq, "consumer registered");
                peers.insert(peer.seq, peer);
            }
            Some(seq) = leaves.recv() => {
                // Idempotent: the peer may already be gone.
                if peers.remove(&seq).is_some() {
                    debug!(consumer = seq, "consumer removed");
                }
            }
            frame = frames.recv() => match frame {
                Some(frame) => fan_out(frame, &mut peers).await,
                // Supplier side is gone; nothing more will ever arrive.
                None => break,
            },
        }
    }

    // Dropping the peer map drops every inbox sender; each relay drains its
    // queue, releasing the frames, and exits.
    drop(peers);

    // The supplier releases its in-hand frame on shutdown and then drops its
    // sender; anything it already published still has to find its way back to
    // the pool.
    while let Some(frame) = frames.recv().await {
        frame.adjust_uses(-1);
    }
}

/// Hand one frame to every live peer.
///
/// The use count is raised by the peer cardinality up front, each peer's
/// inbox gets a handle clone, and the dispatcher's own hold (inherited from
/// the supplier's acquire) is released last. A push to a peer whose relay
/// has vanished counts as received-and-failed: its use is released here so
/// the balance still drains to zero.
async fn fan_out(frame: Frame, peers: &mut HashMap<u64, Peer>) {
    frame.adjust_uses(peers.len() as isize);

    let mut vanished = Vec::new();
    for peer in peers.values() {
        if peer.inbox.send(frame.clone()).await.is_err() {
            frame.adjust_uses(-1);
            vanished.push(peer.seq);
        }
    }
    for seq in vanished {
        peers.remove(&seq);
    }

    frame.adjust_uses(-1);
}

/// Accept loop for output stream consumers: spawn a relay per connection and
/// register the peer with the dispatcher.
async fn accept_peers(
    listener: RelayListener,
    inbox_capacity: usize,
    write_timeout: Option<Duration>,
    joins: mpsc::Sender<Peer>,
    leaves: mpsc::UnboundedSender<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_seq: u64 = 0;

    loop {
        let (conn, addr) = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "failed to accept output stream consumer");
                    sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
        };

        let seq = next_seq;
        next_seq += 1;

        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity);
        let relay = Relay {
            seq,
            conn,
            inbox: inbox_rx,
            leaves: leaves.clone(),
            write_timeout,
        };
        tokio::spawn(relay.run());

        tokio::select! {
            registered = joins.send(Peer { seq, inbox: inbox_tx }) => {
                if registered.is_err() {
                    // Dispatcher already exited; the relay sees its inbox
                    // close and winds down on its own.
                    return;
                }
                info!(consumer = seq, %addr, "serving output stream consumer");
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Per-peer writer: drains the inbox to the consumer socket.
struct Relay {
    seq: u64,
    conn: RelayStream,
    inbox: mpsc::Receiver<Frame>,
    leaves: mpsc::UnboundedSender<u64>,
    write_timeout: Option<Duration>,
}

impl Relay {
    /// Every frame that enters the inbox is released exactly once: after a
    /// successful write, after a failed write, or in the drain loop. That
    /// pairing is what keeps the pool's use counts balanced.
    async fn run(mut self) {
        while let Some(frame) = self.inbox.recv().await {
            let written = self.write(frame.payload()).await;
            frame.adjust_uses(-1);
            if let Err(err) = written {
                warn!(consumer = self.seq, %err, "failed to forward frame to output stream consumer, disconnecting it");
                // Best effort: the dispatcher may already be gone.
                let _ = self.leaves.send(self.seq);
                break;
            }
        }

        // Inbox closed, or this relay broke off after a write failure:
        // release whatever is still queued.
        while let Some(frame) = self.inbox.recv().await {
            frame.adjust_uses(-1);
        }
    }

    async fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        match self.write_timeout {
            Some(limit) => match timeout(limit, self.conn.write_all(payload)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                )),
            },
            None => self.conn.write_all(payload).await,
        }
    }
}
