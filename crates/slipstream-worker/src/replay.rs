//! Replay of queued requests once the network is back.

use futures::future::join_all;
use slipstream_fetch::NetworkClient;
use slipstream_queue::{DurableQueue, QueuedRequest};
use tracing::{debug, error, info, warn};

/// Outcome of one replay run.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Entries loaded from the queue.
    pub attempted: usize,
    /// Keys whose replay succeeded and were deleted.
    pub replayed: Vec<u64>,
    /// Keys left in place for a future replay.
    pub failed: Vec<u64>,
}

/// Whether a replayed response counts as delivered.
fn delivered(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Reissue every queued request against the network.
///
/// All entries are dispatched concurrently and every outcome is awaited;
/// one failing request never starves the others. Successful entries are
/// deleted, failed ones stay queued with their retry count bumped.
pub async fn replay(queue: &DurableQueue, network: &dyn NetworkClient) -> ReplayReport {
    let entries = match queue.all().await {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "could not load queued requests");
            return ReplayReport::default();
        }
    };

    if entries.is_empty() {
        debug!("nothing queued to replay");
        return ReplayReport::default();
    }

    let mut report = ReplayReport {
        attempted: entries.len(),
        ..Default::default()
    };

    let attempts = entries.into_iter().map(|entry| async move {
        let ok = match entry.to_request() {
            Ok(request) => match network.fetch(request).await {
                Ok(response) => delivered(response.status),
                Err(e) => {
                    warn!(key = entry.queued_at, url = %entry.url, error = %e, "replay failed");
                    false
                }
            },
            Err(e) => {
                warn!(key = entry.queued_at, url = %entry.url, error = %e, "queued record unusable");
                false
            }
        };
        (entry, ok)
    });

    for (entry, ok) in join_all(attempts).await {
        settle(queue, entry, ok, &mut report).await;
    }

    info!(
        attempted = report.attempted,
        replayed = report.replayed.len(),
        failed = report.failed.len(),
        "replay finished"
    );
    report
}

async fn settle(queue: &DurableQueue, entry: QueuedRequest, ok: bool, report: &mut ReplayReport) {
    let key = entry.queued_at;
    if ok {
        match queue.remove(key).await {
            Ok(_) => report.replayed.push(key),
            Err(e) => {
                // Delivered but not deleted; the next replay may duplicate it.
                error!(key, error = %e, "replayed entry could not be removed");
                report.failed.push(key);
            }
        }
    } else {
        if let Err(e) = queue.record_failure(entry).await {
            error!(key, error = %e, "failed to record replay failure");
        }
        report.failed.push(key);
    }
}
