//! Opaque byte relay between two connections
//!
//! Used for tunnels the policy does not intercept and for intercepted
//! sessions that switched protocols (`101`). The relay ends as soon as either
//! direction reaches EOF, fails, or both stay quiet past the idle timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::error::{Leg, ProxyError};

const RELAY_BUFFER: usize = 16 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Why a relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    DestinationClosed,
    IdleTimeout,
}

/// Byte counts for a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_destination: u64,
    pub destination_to_client: u64,
    pub end: RelayEnd,
}

/// Last time any byte moved, as millis since `start`
struct Activity {
    start: Instant,
    last: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Copy bytes both ways until one side ends
pub async fn relay<C, D>(
    client: C,
    destination: D,
    idle_timeout: Duration,
) -> Result<RelayStats, ProxyError>
where
    C: AsyncRead + AsyncWrite,
    D: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut dest_rd, mut dest_wr) = tokio::io::split(destination);

    let upstream = AtomicU64::new(0);
    let downstream = AtomicU64::new(0);
    let activity = Activity::new();

    let outcome = tokio::select! {
        r = pump(&mut client_rd, &mut dest_wr, Leg::Client, Leg::Destination, &upstream, &activity) => {
            finished(r, RelayEnd::ClientClosed)
        }
        r = pump(&mut dest_rd, &mut client_wr, Leg::Destination, Leg::Client, &downstream, &activity) => {
            finished(r, RelayEnd::DestinationClosed)
        }
        _ = idle_watch(&activity, idle_timeout) => Ok(RelayEnd::IdleTimeout),
    };

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, client_wr.shutdown()).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, dest_wr.shutdown()).await;

    let end = outcome?;
    let stats = RelayStats {
        client_to_destination: upstream.load(Ordering::Relaxed),
        destination_to_client: downstream.load(Ordering::Relaxed),
        end,
    };

    debug!(
        bytes_up = stats.client_to_destination,
        bytes_down = stats.destination_to_client,
        end = ?stats.end,
        "Relay finished"
    );

    Ok(stats)
}

fn finished(result: Result<(), ProxyError>, on_eof: RelayEnd) -> Result<RelayEnd, ProxyError> {
    match result {
        Ok(()) => Ok(on_eof),
        Err(ProxyError::TransportClosed { leg: Leg::Client }) => Ok(RelayEnd::ClientClosed),
        Err(ProxyError::TransportClosed {
            leg: Leg::Destination,
        }) => Ok(RelayEnd::DestinationClosed),
        Err(e) => Err(e),
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: Leg,
    to: Leg,
    counter: &AtomicU64,
    activity: &Activity,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| ProxyError::from_io(from, e))?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| ProxyError::from_io(to, e))?;
        writer.flush().await.map_err(|e| ProxyError::from_io(to, e))?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn idle_watch(activity: &Activity, idle_timeout: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= idle_timeout {
            return;
        }
        tokio::time::sleep(idle_timeout - idle).await;
    }
}
