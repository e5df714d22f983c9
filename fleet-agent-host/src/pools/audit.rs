//! Worker audit: reconcile a pool's volume ledger with the hypervisor
//!
//! One cycle adds every unseen volume, drops ledger entries whose volume is
//! gone (only when nothing was added in the same cycle), and refreshes the
//! measured size of at most `batch` stale entries.

use crate::config::PoolSettings;
use crate::hypervisor::{HypervisorError, Virsh, Volume};
use crate::model::{StoragePool, StoragePoolFile};
use crate::store::{field_path, paths, DocumentStore, Patch};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Age assumed for ledger entries that were never measured
const NEVER_CHECKED_AGE_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy)]
pub struct AuditPolicy {
    pub stale_after: Duration,
    pub batch: usize,
}

impl AuditPolicy {
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            stale_after: Duration::days(settings.stale_after_days),
            batch: settings.refresh_batch,
        }
    }
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default())
    }
}

/// Stable ledger id of a volume
pub fn ledger_id(volume_name: &str) -> String {
    URL_SAFE_NO_PAD.encode(volume_name.as_bytes())
}

#[derive(Debug, Default, PartialEq)]
pub struct AuditPlan {
    pub new_files: Vec<StoragePoolFile>,
    pub orphaned: Vec<String>,
    pub stale: Vec<StoragePoolFile>,
}

/// Decide what one audit cycle writes, without touching anything
pub fn plan(
    volumes: &[Volume],
    ledger: &BTreeMap<String, StoragePoolFile>,
    now: DateTime<Utc>,
    policy: &AuditPolicy,
) -> AuditPlan {
    let live: BTreeMap<String, &Volume> = volumes.iter().map(|v| (ledger_id(&v.name), v)).collect();

    let new_files: Vec<StoragePoolFile> = live
        .iter()
        .filter(|(id, _)| !ledger.contains_key(*id))
        .map(|(id, volume)| StoragePoolFile {
            id: id.clone(),
            name: volume.name.clone(),
            allocation: volume.allocation,
            capacity: volume.capacity,
            last_check: None,
        })
        .collect();

    let orphaned = if new_files.is_empty() {
        ledger
            .keys()
            .filter(|id| !live.contains_key(*id))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    let never_checked = now - Duration::days(NEVER_CHECKED_AGE_DAYS);
    let threshold = now - policy.stale_after;
    let stale = ledger
        .values()
        .filter(|file| live.contains_key(&file.id))
        .filter(|file| file.last_check.unwrap_or(never_checked) < threshold)
        .take(policy.batch)
        .cloned()
        .collect();

    AuditPlan {
        new_files,
        orphaned,
        stale,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuditReport {
    pub added: usize,
    pub removed: usize,
    pub refreshed: usize,
}

/// Run one audit cycle for `pool` stored at `storagepools/{pool_id}`
pub async fn run(
    virsh: &Virsh,
    store: &dyn DocumentStore,
    pool_id: &str,
    pool: &StoragePool,
    policy: &AuditPolicy,
    now: DateTime<Utc>,
) -> Result<AuditReport, HypervisorError> {
    let name = pool.hypervisor_name();
    if let Err(e) = virsh.refresh(name).await {
        debug!("pool-refresh {} failed: {}", name, e);
    }
    let volumes = virsh.volumes(name).await?;
    let plan = plan(&volumes, &pool.files, now, policy);
    let path = paths::storage_pool(pool_id);
    let mut report = AuditReport::default();

    let additions = plan.new_files.iter().filter_map(|file| {
        let entry = match serde_json::to_value(file) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cannot encode ledger entry {}: {}", file.name, e);
                return None;
            }
        };
        let patch = Patch::new().set(field_path(&["files", &file.id]), entry);
        let path = path.as_str();
        Some(async move { (file, store.update(path, patch).await) })
    });
    for (file, result) in join_all(additions).await {
        match result {
            Ok(()) => report.added += 1,
            Err(e) => warn!("Failed to add {} to ledger of pool {}: {}", file.name, pool_id, e),
        }
    }

    if !plan.orphaned.is_empty() {
        let removal = plan
            .orphaned
            .iter()
            .fold(Patch::new(), |patch, id| patch.delete(field_path(&["files", id])));
        match store.update(&path, removal).await {
            Ok(()) => report.removed = plan.orphaned.len(),
            Err(e) => warn!("Failed to prune ledger of pool {}: {}", pool_id, e),
        }
    }

    let checked_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    for file in &plan.stale {
        let usage = match virsh.usage(pool, &file.name).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Usage query for {} in pool {} failed: {}", file.name, pool_id, e);
                continue;
            }
        };
        let patch = Patch::new()
            .set(field_path(&["files", &file.id, "Allocation"]), usage.used)
            .set(field_path(&["files", &file.id, "Capacity"]), usage.provisioned)
            .set(field_path(&["files", &file.id, "lastCheck"]), checked_at.clone());
        match store.update(&path, patch).await {
            Ok(()) => report.refreshed += 1,
            Err(e) => warn!("Failed to record usage of {}: {}", file.name, e),
        }
    }

    Ok(report)
}
