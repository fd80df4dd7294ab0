//! Per-peer link I/O.
//!
//! Each connected peer runs three cooperative tasks over one duplex byte
//! stream:
//!
//!   - Reader: frames the byte stream, resyncs on bad magic, hands parsed
//!     frames to the router actor
//!   - Writer: drains the announcement slot, proto FIFO and traffic LIFO
//!     in strict priority order, sending keepalives when idle
//!   - Announcer: watches the "tree changed" signal and requests a freshly
//!     signed announcement for its port
//!
//! All routing decisions happen in the router actor; the tasks here only
//! move bytes. The only state readable outside the actor is the atomic
//! flag/counter block in [`PeerShared`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, watch, Notify};

use crate::error::WireError;
use crate::queues::{BufferPool, FifoQueue, LifoQueue, QUEUE_CAPACITY};
use crate::router::Command;
use crate::types::Port;
use crate::wire::{peek_frame_len, Frame, HEADER_SIZE, MAX_FRAME_SIZE};

/// How often an idle writer emits a keepalive, when enabled on the link.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Reader deadline when keepalives are enabled; a silent link is dead.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Atomic per-peer statistics, reset when the peer stops.
#[derive(Default)]
pub(crate) struct PeerStats {
    pub tx_proto_successful: AtomicU64,
    pub tx_proto_dropped: AtomicU64,
    pub tx_traffic_successful: AtomicU64,
    pub tx_traffic_dropped: AtomicU64,
    pub rx_dropped_no_destination: AtomicU64,
}

impl PeerStats {
    pub fn reset(&self) {
        self.tx_proto_successful.store(0, Ordering::Relaxed);
        self.tx_proto_dropped.store(0, Ordering::Relaxed);
        self.tx_traffic_successful.store(0, Ordering::Relaxed);
        self.tx_traffic_dropped.store(0, Ordering::Relaxed);
        self.rx_dropped_no_destination.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeerStatistics {
        PeerStatistics {
            tx_proto_successful: self.tx_proto_successful.load(Ordering::Relaxed),
            tx_proto_dropped: self.tx_proto_dropped.load(Ordering::Relaxed),
            tx_traffic_successful: self.tx_traffic_successful.load(Ordering::Relaxed),
            tx_traffic_dropped: self.tx_traffic_dropped.load(Ordering::Relaxed),
            rx_dropped_no_destination: self.rx_dropped_no_destination.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a peer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    pub tx_proto_successful: u64,
    pub tx_proto_dropped: u64,
    pub tx_traffic_successful: u64,
    pub tx_traffic_dropped: u64,
    pub rx_dropped_no_destination: u64,
}

/// Single-slot mailbox for the pending tree announcement. A newer
/// announcement replaces an unsent one; the writer drains it first.
#[derive(Default)]
pub(crate) struct AnnounceSlot {
    slot: Mutex<Option<Frame>>,
    notify: Notify,
}

impl AnnounceSlot {
    pub fn put(&self, frame: Frame) {
        *self.slot.lock().unwrap() = Some(frame);
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<Frame> {
        self.slot.lock().unwrap().take()
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Cooperative cancellation shared by a peer's three tasks.
#[derive(Default)]
pub(crate) struct Cancellation {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

/// State shared between a peer's tasks and the router actor.
pub(crate) struct PeerShared {
    /// Unique across the router's lifetime; guards against a stale
    /// disconnect hitting a reused port slot.
    pub id: u64,
    pub port: Port,
    pub started: AtomicBool,
    pub alive: AtomicBool,
    pub stats: PeerStats,
    pub proto_out: FifoQueue,
    pub traffic_out: LifoQueue,
    pub announce: AnnounceSlot,
    pub cancel: Cancellation,
}

impl PeerShared {
    pub fn new(id: u64, port: Port) -> Arc<Self> {
        Arc::new(Self {
            id,
            port,
            started: AtomicBool::new(true),
            alive: AtomicBool::new(false),
            stats: PeerStats::default(),
            proto_out: FifoQueue::new(QUEUE_CAPACITY),
            traffic_out: LifoQueue::new(QUEUE_CAPACITY),
            announce: AnnounceSlot::default(),
            cancel: Cancellation::default(),
        })
    }

    /// Stop the tasks and clear queued state. Idempotent.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.alive.store(false, Ordering::Release);
        self.cancel.cancel();
        self.proto_out.clear();
        self.traffic_out.clear();
        self.stats.reset();
    }
}

/// Spawn the reader, writer and announcer tasks for a connected peer.
pub(crate) fn spawn<R, W>(
    shared: Arc<PeerShared>,
    read_half: R,
    write_half: W,
    commands: mpsc::Sender<Command>,
    tree_changed: watch::Receiver<u64>,
    pool: Arc<BufferPool>,
    keepalives: bool,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let reader_shared = shared.clone();
    let reader_commands = commands.clone();
    tokio::spawn(async move {
        let reason = read_loop(&reader_shared, read_half, &reader_commands, keepalives).await;
        if let Some(reason) = reason {
            request_disconnect(&reader_shared, &reader_commands, reason).await;
        }
    });

    let writer_shared = shared.clone();
    let writer_commands = commands.clone();
    tokio::spawn(async move {
        if let Some(reason) = write_loop(&writer_shared, write_half, &pool, keepalives).await {
            request_disconnect(&writer_shared, &writer_commands, reason).await;
        }
    });

    tokio::spawn(async move {
        announce_loop(&shared, &commands, tree_changed).await;
    });
}

async fn request_disconnect(shared: &PeerShared, commands: &mpsc::Sender<Command>, reason: String) {
    if shared.cancel.is_cancelled() {
        // The router already tore this peer down.
        return;
    }
    let _ = commands
        .send(Command::Disconnect {
            port: shared.port,
            peer_id: shared.id,
            reason,
        })
        .await;
}

// ── Reader ───────────────────────────────────────────────────────────

/// Runs until cancellation or a fatal link error. Returns a disconnect
/// reason, or `None` for a cancellation-driven exit.
async fn read_loop<R: AsyncRead + Unpin>(
    shared: &PeerShared,
    read_half: R,
    commands: &mpsc::Sender<Command>,
    keepalives: bool,
) -> Option<String> {
    let mut reader = BufReader::new(read_half);
    loop {
        let next = async {
            if keepalives {
                match tokio::time::timeout(KEEPALIVE_TIMEOUT, read_frame(&mut reader)).await {
                    Ok(result) => result,
                    Err(_) => Err(WireError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "keepalive timeout",
                    ))),
                }
            } else {
                read_frame(&mut reader).await
            }
        };
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return None,
            result = next => match result {
                Ok((Frame::Keepalive, _)) => continue,
                Ok((frame, discarded)) => {
                    if discarded > 0 {
                        tracing::debug!(port = shared.port, discarded, "resynced after bad magic");
                    }
                    if commands
                        .send(Command::FrameReceived { port: shared.port, peer_id: shared.id, frame })
                        .await
                        .is_err()
                    {
                        // Router shut down.
                        return None;
                    }
                }
                Err(e) => return Some(format!("read failed: {e}")),
            },
        }
    }
}

/// Read exactly one frame, discarding bytes until the magic lines up.
/// Returns the frame and the number of bytes discarded during resync.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(Frame, usize), WireError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let mut discarded = 0usize;
    let frame_len = loop {
        match peek_frame_len(&header) {
            Ok(len) => break len,
            Err(WireError::BadMagic) => {
                // Drop one byte and slide the window forward.
                header.copy_within(1.., 0);
                reader.read_exact(&mut header[HEADER_SIZE - 1..]).await?;
                discarded += 1;
            }
            Err(e) => return Err(e),
        }
    };

    debug_assert!(frame_len <= MAX_FRAME_SIZE);
    let mut buf = vec![0u8; frame_len];
    buf[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut buf[HEADER_SIZE..]).await?;
    let (frame, _) = Frame::unmarshal(&buf)?;
    Ok((frame, discarded))
}

// ── Writer ───────────────────────────────────────────────────────────

/// Drains the three outbound sources with strict priority, parking only
/// when all are empty. Returns a disconnect reason on write failure.
async fn write_loop<W: AsyncWrite + Unpin>(
    shared: &PeerShared,
    write_half: W,
    pool: &BufferPool,
    keepalives: bool,
) -> Option<String> {
    let mut writer = BufWriter::new(write_half);
    let mut keepalive_tick = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let frame = if let Some(frame) = shared.announce.take() {
            Some(frame)
        } else if let Some(frame) = shared.proto_out.pop() {
            Some(frame)
        } else {
            shared.traffic_out.pop()
        };

        if let Some(frame) = frame {
            if let Err(e) = send_frame(&mut writer, pool, &frame).await {
                if matches!(e, WireError::Io(_)) {
                    return Some(format!("write failed: {e}"));
                }
                // Marshal failure: drop the frame, keep the link.
                tracing::warn!(
                    port = shared.port,
                    error = %e,
                    frame_type = ?frame.frame_type(),
                    "failed to marshal outbound frame"
                );
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return None,
            _ = shared.announce.wait() => {}
            _ = shared.proto_out.wait() => {}
            _ = shared.traffic_out.wait() => {}
            _ = keepalive_tick.tick(), if keepalives => {
                if let Err(e) = send_frame(&mut writer, pool, &Frame::Keepalive).await {
                    return Some(format!("keepalive write failed: {e}"));
                }
            }
        }
    }
}

async fn send_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    pool: &BufferPool,
    frame: &Frame,
) -> Result<(), WireError> {
    let mut buf = pool.acquire();
    let result = frame.marshal(&mut buf);
    let outcome = match result {
        Ok(n) => {
            let write = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
                Ok::<_, std::io::Error>(())
            }
            .await;
            write.map_err(WireError::from)
        }
        Err(e) => Err(e),
    };
    pool.release(buf);
    outcome
}

// ── Announcer ────────────────────────────────────────────────────────

/// Requests a signed announcement for this port whenever the tree changes.
async fn announce_loop(
    shared: &PeerShared,
    commands: &mpsc::Sender<Command>,
    mut tree_changed: watch::Receiver<u64>,
) {
    // Announce immediately on start so a new link learns our root.
    let request = Command::GenerateAnnouncement {
        port: shared.port,
        peer_id: shared.id,
    };
    if commands.send(request).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            changed = tree_changed.changed() => {
                if changed.is_err() {
                    return;
                }
                let request = Command::GenerateAnnouncement {
                    port: shared.port,
                    peer_id: shared.id,
                };
                if commands.send(request).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Coordinates;

    fn traffic(tag: u8) -> Frame {
        Frame::TreeRouted {
            destination: Coordinates::default(),
            source: Coordinates::default(),
            payload: vec![tag],
        }
    }

    #[test]
    fn announce_slot_latest_wins() {
        let slot = AnnounceSlot::default();
        slot.put(traffic(1));
        slot.put(traffic(2));
        match slot.take() {
            Some(Frame::TreeRouted { payload, .. }) => assert_eq!(payload, vec![2]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(slot.take().is_none());
    }

    #[tokio::test]
    async fn cancellation_wakes_waiters() {
        let cancel = Arc::new(Cancellation::default());
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.cancelled().await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        waiter.await.unwrap();
        assert!(cancel.is_cancelled());
        // Already-cancelled waits return immediately.
        cancel.cancelled().await;
    }

    #[tokio::test]
    async fn read_frame_resyncs_on_garbage() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let frame = traffic(42);
        let mut buf = [0u8; 64];
        let n = frame.marshal(&mut buf).unwrap();

        tx.write_all(b"junk").await.unwrap();
        tx.write_all(&buf[..n]).await.unwrap();

        let mut reader = BufReader::new(rx);
        let (decoded, discarded) = read_frame(&mut reader).await.unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(discarded, 4);
    }

    #[tokio::test]
    async fn read_frame_rejects_unknown_version() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut buf = [0u8; 64];
        let n = Frame::Keepalive.marshal(&mut buf).unwrap();
        buf[4] = 9;
        tx.write_all(&buf[..n]).await.unwrap();

        let mut reader = BufReader::new(rx);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::UnsupportedVersion(9))
        ));
    }

    #[tokio::test]
    async fn reader_hands_frames_to_commands() {
        let shared = PeerShared::new(1, 1);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (mut tx, rx) = tokio::io::duplex(1024);

        let reader_shared = shared.clone();
        let handle = tokio::spawn(async move {
            read_loop(&reader_shared, rx, &cmd_tx, false).await
        });

        let frame = traffic(7);
        let mut buf = [0u8; 64];
        let n = frame.marshal(&mut buf).unwrap();
        tx.write_all(&buf[..n]).await.unwrap();

        match cmd_rx.recv().await {
            Some(Command::FrameReceived { port, frame: got, .. }) => {
                assert_eq!(port, 1);
                assert_eq!(got, frame);
            }
            _ => panic!("expected a received frame command"),
        }

        shared.cancel.cancel();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn writer_prefers_announcements_over_traffic() {
        let shared = PeerShared::new(1, 1);
        let pool = Arc::new(BufferPool::new(2));
        let (tx, rx) = tokio::io::duplex(4096);

        shared.traffic_out.push(traffic(1));
        shared.announce.put(traffic(9)); // stands in for an announcement

        let writer_shared = shared.clone();
        let handle =
            tokio::spawn(async move { write_loop(&writer_shared, tx, &pool, false).await });

        let mut reader = BufReader::new(rx);
        let (first, _) = read_frame(&mut reader).await.unwrap();
        let (second, _) = read_frame(&mut reader).await.unwrap();
        match (first, second) {
            (
                Frame::TreeRouted { payload: a, .. },
                Frame::TreeRouted { payload: b, .. },
            ) => {
                assert_eq!(a, vec![9]);
                assert_eq!(b, vec![1]);
            }
            other => panic!("unexpected frames {other:?}"),
        }

        shared.cancel.cancel();
        assert_eq!(handle.await.unwrap(), None);
    }
}
