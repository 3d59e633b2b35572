use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::AppError;
use crate::models::{Registry, RetentionPolicy, ScanPolicy, VulnerabilityScan};

/// Persistence for registries, policies and scan results.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn list_registries(&self) -> Result<Vec<Registry>>;

    async fn get_registry(&self, id: i64) -> Result<Registry>;

    /// Insert a registry, assigning its id
    async fn add_registry(&self, registry: Registry) -> Result<Registry>;

    /// Stored policy, or the default policy if none was saved
    async fn get_retention_policy(&self, registry_id: i64) -> Result<RetentionPolicy>;

    async fn save_retention_policy(&self, policy: RetentionPolicy) -> Result<()>;

    async fn mark_retention_run(&self, registry_id: i64, at: DateTime<Utc>) -> Result<()>;

    async fn get_scan_policy(&self, registry_id: i64) -> Result<ScanPolicy>;

    /// Upsert by registry; run timestamps already recorded are kept
    async fn save_scan_policy(&self, policy: ScanPolicy) -> Result<ScanPolicy>;

    async fn list_enabled_scan_policies(&self) -> Result<Vec<ScanPolicy>>;

    async fn update_policy_run_time(
        &self,
        policy_id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()>;

    /// Insert or update the scan for (registry, repository, tag); returns its id
    async fn upsert_scan(&self, scan: &VulnerabilityScan) -> Result<i64>;

    async fn get_scan(
        &self,
        registry_id: i64,
        repository: &str,
        tag: &str,
    ) -> Result<Option<VulnerabilityScan>>;

    /// Scans for a registry, newest first
    async fn list_scans(&self, registry_id: i64) -> Result<Vec<VulnerabilityScan>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    next_id: i64,
    #[serde(default)]
    registries: Vec<Registry>,
    #[serde(default)]
    retention_policies: Vec<RetentionPolicy>,
    #[serde(default)]
    scan_policies: Vec<ScanPolicy>,
    #[serde(default)]
    scans: Vec<VulnerabilityScan>,
}

impl StoreState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store, optionally written through to a JSON file
pub struct JsonStore {
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
}

impl JsonStore {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Load `path` if it exists; every mutation is written back to it
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse state file {:?}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("State file {:?} not found, starting empty", path);
                StoreState::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state file {:?}", path))
            }
        };

        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }

    /// Apply `change` to a copy of the state. The copy replaces the live state
    /// only after it has been written out.
    async fn update<T, F>(&self, change: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut StoreState) -> Result<T> + Send,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(out)
    }
}

#[async_trait]
impl PolicyStore for JsonStore {
    async fn list_registries(&self) -> Result<Vec<Registry>> {
        Ok(self.state.read().await.registries.clone())
    }

    async fn get_registry(&self, id: i64) -> Result<Registry> {
        self.state
            .read()
            .await
            .registries
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| AppError::RegistryNotFound(id).into())
    }

    async fn add_registry(&self, mut registry: Registry) -> Result<Registry> {
        self.update(move |state| {
            registry.id = state.allocate_id();
            state.registries.push(registry.clone());
            Ok(registry)
        })
        .await
    }

    async fn get_retention_policy(&self, registry_id: i64) -> Result<RetentionPolicy> {
        let state = self.state.read().await;
        Ok(state
            .retention_policies
            .iter()
            .find(|p| p.registry_id == registry_id)
            .cloned()
            .unwrap_or_else(|| RetentionPolicy::default_for(registry_id)))
    }

    async fn save_retention_policy(&self, policy: RetentionPolicy) -> Result<()> {
        self.update(move |state| {
            match state
                .retention_policies
                .iter_mut()
                .find(|p| p.registry_id == policy.registry_id)
            {
                Some(existing) => {
                    let last_run_at = existing.last_run_at;
                    *existing = RetentionPolicy {
                        last_run_at,
                        ..policy
                    };
                }
                None => state.retention_policies.push(policy),
            }
            Ok(())
        })
        .await
    }

    async fn mark_retention_run(&self, registry_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.update(move |state| {
            if let Some(p) = state
                .retention_policies
                .iter_mut()
                .find(|p| p.registry_id == registry_id)
            {
                p.last_run_at = Some(at);
            }
            Ok(())
        })
        .await
    }

    async fn get_scan_policy(&self, registry_id: i64) -> Result<ScanPolicy> {
        let state = self.state.read().await;
        Ok(state
            .scan_policies
            .iter()
            .find(|p| p.registry_id == registry_id)
            .cloned()
            .unwrap_or_else(|| ScanPolicy::default_for(registry_id)))
    }

    async fn save_scan_policy(&self, mut policy: ScanPolicy) -> Result<ScanPolicy> {
        self.update(move |state| {
            let existing = state
                .scan_policies
                .iter()
                .position(|p| p.registry_id == policy.registry_id);

            match existing {
                Some(idx) => {
                    let current = &mut state.scan_policies[idx];
                    policy.id = current.id;
                    policy.last_run_at = current.last_run_at;
                    *current = policy.clone();
                }
                None => {
                    policy.id = state.allocate_id();
                    state.scan_policies.push(policy.clone());
                }
            }
            Ok(policy)
        })
        .await
    }

    async fn list_enabled_scan_policies(&self) -> Result<Vec<ScanPolicy>> {
        let state = self.state.read().await;
        Ok(state
            .scan_policies
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect())
    }

    async fn update_policy_run_time(
        &self,
        policy_id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        self.update(move |state| {
            let policy = state
                .scan_policies
                .iter_mut()
                .find(|p| p.id == policy_id)
                .with_context(|| format!("Scan policy {} not found", policy_id))?;
            policy.last_run_at = Some(last_run);
            policy.next_run_at = Some(next_run);
            Ok(())
        })
        .await
    }

    async fn upsert_scan(&self, scan: &VulnerabilityScan) -> Result<i64> {
        self.update(|state| {
            let id = match state.scans.iter_mut().find(|s| s.same_image(scan)) {
                Some(existing) => {
                    debug!(
                        "Updating scan for {}:{} ({})",
                        scan.repository, scan.tag, scan.status
                    );
                    let id = existing.id;
                    *existing = VulnerabilityScan {
                        id,
                        ..scan.clone()
                    };
                    id
                }
                None => {
                    debug!(
                        "Inserting scan for {}:{} ({})",
                        scan.repository, scan.tag, scan.status
                    );
                    let id = state.allocate_id();
                    state.scans.push(VulnerabilityScan {
                        id,
                        ..scan.clone()
                    });
                    id
                }
            };
            Ok(id)
        })
        .await
    }

    async fn get_scan(
        &self,
        registry_id: i64,
        repository: &str,
        tag: &str,
    ) -> Result<Option<VulnerabilityScan>> {
        let state = self.state.read().await;
        Ok(state
            .scans
            .iter()
            .find(|s| s.registry_id == registry_id && s.repository == repository && s.tag == tag)
            .cloned())
    }

    async fn list_scans(&self, registry_id: i64) -> Result<Vec<VulnerabilityScan>> {
        let state = self.state.read().await;
        let mut scans: Vec<VulnerabilityScan> = state
            .scans
            .iter()
            .filter(|s| s.registry_id == registry_id)
            .cloned()
            .collect();
        scans.sort_by(|a, b| b.scanned_at.cmp(&a.scanned_at));
        Ok(scans)
    }
}
