//! Connection pump
//!
//! Copies bytes in both directions between the accepted side of a proxied
//! connection and the side the relay opened for it. When either direction
//! reaches end-of-stream or fails, both ends are shut down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::debug;

use crate::ssh::TunnelError;

const PUMP_BUFFER_SIZE: usize = 32768;

/// How often `drain_connections` checks the active count
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long force-closed pumps get to unwind
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Statistics for a relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Bytes from the accepted side to the opened side
    pub bytes_sent: u64,
    /// Bytes from the opened side back to the accepted side
    pub bytes_received: u64,
}

/// Lock-free counters shared between a relay and its pumps
#[derive(Debug, Default)]
pub struct ForwardStatsAtomic {
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ForwardStatsAtomic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_stats(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Count a new connection as active until the guard drops
    pub(crate) fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            stats: self.clone(),
        }
    }
}

pub(crate) struct ConnectionGuard {
    stats: Arc<ForwardStatsAtomic>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Last time either direction of a pump moved bytes
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Pump bytes between `accepted` and `opened` until one side closes, neither
/// direction has moved bytes for `idle_timeout`, or `close_rx` fires.
pub(crate) async fn pump<A, B>(
    accepted: A,
    opened: B,
    stats: &ForwardStatsAtomic,
    idle_timeout: Duration,
    mut close_rx: broadcast::Receiver<()>,
) -> Result<(), TunnelError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut accepted_read, mut accepted_write) = tokio::io::split(accepted);
    let (mut opened_read, mut opened_write) = tokio::io::split(opened);
    let activity = Activity::new();

    let result = tokio::select! {
        r = copy_half(&mut accepted_read, &mut opened_write, &stats.bytes_sent, &activity) => r,
        r = copy_half(&mut opened_read, &mut accepted_write, &stats.bytes_received, &activity) => r,
        _ = idle_watch(&activity, idle_timeout) => {
            debug!("Pump idle for {:?}, closing", idle_timeout);
            Ok(())
        }
        _ = close_rx.recv() => {
            debug!("Pump force-closed");
            Ok(())
        }
    };

    let _ = accepted_write.shutdown().await;
    let _ = opened_write.shutdown().await;

    result.map_err(TunnelError::from)
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.touch();
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Resolves once `activity` has been quiet for `idle_timeout`
async fn idle_watch(activity: &Activity, idle_timeout: Duration) {
    loop {
        let idle_for = activity.idle_for();
        if idle_for >= idle_timeout {
            return;
        }
        tokio::time::sleep(idle_timeout - idle_for).await;
    }
}

/// Wait up to `grace` for active pumps to finish. On expiry, signal
/// `close_tx` so the remaining pumps close their sockets, and report how many
/// were still running.
pub(crate) async fn drain_connections(
    stats: &ForwardStatsAtomic,
    grace: Duration,
    close_tx: &broadcast::Sender<()>,
) -> Result<(), TunnelError> {
    let start = Instant::now();
    while stats.active() > 0 {
        if start.elapsed() >= grace {
            let active = stats.active();
            let _ = close_tx.send(());

            let deadline = Instant::now() + FORCE_CLOSE_WAIT;
            while stats.active() > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return Err(TunnelError::ShutdownTimeout { active });
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
    Ok(())
}
