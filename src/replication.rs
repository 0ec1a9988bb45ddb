//! One-shot replication between a remote and a local store.

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::doc_store::DocumentStore;
use crate::remote::RemoteDatabase;
use crate::sync_error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationDirection {
    /// Remote into local only.
    Pull,
    /// Remote into local, then local into remote.
    PushAndPull,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    /// Remote revisions that replaced or created a local document.
    pub pulled: usize,
    /// Local documents the remote accepted.
    pub pushed: usize,
}

/// Runs one replication pass, bounded by `timeout`.
///
/// Every failure, including the timeout, is reported as
/// [`SyncError::SyncUnavailable`]; the local store is left with whatever was
/// written before the failure.
pub async fn replicate_once(
    remote: &dyn RemoteDatabase,
    local: &dyn DocumentStore,
    direction: ReplicationDirection,
    timeout: Duration,
) -> Result<ReplicationReport> {
    let target = remote.info().url();
    info!("Replicating {target} -> {} ({direction:?})", local.name());

    let report = match tokio::time::timeout(timeout, run(remote, local, direction)).await {
        Ok(Ok(report)) => report,
        Ok(Err(SyncError::SyncUnavailable(msg))) => return Err(SyncError::SyncUnavailable(msg)),
        Ok(Err(e)) => return Err(SyncError::SyncUnavailable(format!("replication of {} failed: {e}", local.name()))),
        Err(_) => {
            return Err(SyncError::SyncUnavailable(format!(
                "replication of {} timed out after {}s",
                local.name(),
                timeout.as_secs_f32()
            )))
        }
    };

    info!(
        "Replication of {} finished: {} pulled, {} pushed",
        local.name(),
        report.pulled,
        report.pushed
    );
    Ok(report)
}

async fn run(
    remote: &dyn RemoteDatabase,
    local: &dyn DocumentStore,
    direction: ReplicationDirection,
) -> Result<ReplicationReport> {
    let mut report = ReplicationReport::default();

    for doc in remote.fetch_all().await? {
        if doc.is_design() {
            debug!("Skipping remote design document {} for {}", doc.id, local.name());
            continue;
        }
        let id = doc.id.clone();
        if local.put_replicated(doc).await? {
            report.pulled += 1;
        } else {
            debug!("Kept local revision of {id} in {}", local.name());
        }
    }

    if direction == ReplicationDirection::PushAndPull {
        // Views are evaluated locally; design documents never cross in either direction.
        let outgoing = local
            .changes()
            .await?
            .into_iter()
            .filter(|doc| !doc.is_design())
            .collect::<Vec<_>>();
        report.pushed = remote.push(outgoing).await?;
    }

    Ok(report)
}
