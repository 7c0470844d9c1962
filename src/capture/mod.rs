//! Continuous WAL capture around the backup window.
//!
//! The capture process has to be streaming before the window opens, and it
//! has to have flushed the WAL up to the backup stop point before it is
//! stopped. Both conditions are probed through `pg_stat_replication` when
//! possible; when the probe is unavailable we fall back to a fixed delay,
//! which is only a heuristic: on a busy source the last segment may still be
//! in flight when capture stops.

pub mod receivewal;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::postgres::{Catalog, Lsn};
use crate::{Error, Result};

pub use receivewal::PgReceiveWal;

/// Controls one external WAL streaming process.
#[async_trait]
pub trait WalCapture: Send {
    /// `application_name` the process reports to the source cluster.
    fn application_name(&self) -> &str;

    async fn start(&mut self, staging_dir: &Path) -> Result<()>;

    /// True if the process was started and has since terminated.
    fn has_exited(&mut self) -> Result<bool>;

    /// Requests a graceful stop. A missing process is not an error.
    async fn stop(&mut self) -> Result<()>;
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The source reported the expected state.
    Confirmed,
    /// The wait timed out or could not be verified.
    Assumed,
}

/// Waits until the capture process shows up as a streaming receiver.
///
/// Fails if the process exits during the wait.
pub async fn wait_until_streaming<C, W>(
    catalog: &C,
    capture: &mut W,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Readiness>
where
    C: Catalog + ?Sized,
    W: WalCapture + ?Sized,
{
    let deadline = Instant::now() + timeout;
    info!(timeout = ?timeout, "Waiting for WAL capture to start streaming");

    loop {
        if capture.has_exited()? {
            return Err(Error::Launch {
                message: "WAL capture process exited during warm-up".to_string(),
            });
        }

        match catalog.receiver_flush_lsn(capture.application_name()).await {
            Ok(Some(lsn)) => {
                info!(flush_lsn = %lsn, "WAL capture is streaming");
                return Ok(Readiness::Confirmed);
            }
            Ok(None) => debug!("WAL capture not streaming yet"),
            Err(e) => {
                warn!(
                    "Cannot probe pg_stat_replication ({}); falling back to a fixed {:?} warm-up",
                    e, timeout
                );
                sleep_until(deadline).await;
                if capture.has_exited()? {
                    return Err(Error::Launch {
                        message: "WAL capture process exited during warm-up".to_string(),
                    });
                }
                return Ok(Readiness::Assumed);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                "WAL capture not confirmed as streaming after {:?}; continuing, \
                 WAL written before it connects will be missing from the replica",
                timeout
            );
            return Ok(Readiness::Assumed);
        }
        sleep(poll_interval.min(deadline - now)).await;
    }
}

/// Waits until the receiver has flushed WAL up to `target`, or for the full
/// `timeout` when no target is known. Never fails: this runs during cleanup.
pub async fn wait_for_flush<C>(
    catalog: &C,
    application_name: &str,
    target: Option<Lsn>,
    timeout: Duration,
    poll_interval: Duration,
) -> Readiness
where
    C: Catalog + ?Sized,
{
    let deadline = Instant::now() + timeout;

    let Some(target) = target else {
        info!(
            "Waiting {:?} for the last WAL segment to be transferred (stop position unknown)",
            timeout
        );
        sleep_until(deadline).await;
        return Readiness::Assumed;
    };

    info!(target_lsn = %target, timeout = ?timeout, "Waiting for WAL capture to flush");
    loop {
        match catalog.receiver_flush_lsn(application_name).await {
            Ok(Some(flushed)) if flushed >= target => {
                info!(flush_lsn = %flushed, "WAL capture reached the backup stop position");
                return Readiness::Confirmed;
            }
            Ok(flushed) => debug!(flush_lsn = ?flushed, "WAL capture still behind"),
            Err(e) => {
                warn!(
                    "Cannot probe pg_stat_replication ({}); falling back to a fixed {:?} drain",
                    e, timeout
                );
                sleep_until(deadline).await;
                return Readiness::Assumed;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                target_lsn = %target,
                "WAL capture did not confirm the backup stop position within {:?}; \
                 the replica may need WAL from the archive to become consistent",
                timeout
            );
            return Readiness::Assumed;
        }
        sleep(poll_interval.min(deadline - now)).await;
    }
}
