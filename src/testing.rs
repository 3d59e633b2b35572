//! In-memory stand-ins for the registry and scanner ports.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::Registry;
use crate::registry::{RegistryAccess, RegistryConnector};
use crate::scanner::{ScanOutput, Scanner};

#[derive(Default)]
struct FakeState {
    repos: BTreeMap<String, Vec<(String, String, DateTime<Utc>)>>,
    fail_catalog: bool,
    fail_tags: HashSet<String>,
    fail_digest: HashSet<(String, String)>,
    fail_created: HashSet<(String, String)>,
    fail_delete: HashSet<String>,
    deleted: Vec<(String, String)>,
    fetch_delay: Duration,
}

#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeRegistry {
    pub fn add_tag(&self, repo: &str, tag: &str, digest: &str, created: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .repos
            .entry(repo.to_string())
            .or_default()
            .push((tag.to_string(), digest.to_string(), created));
    }

    pub fn add_repo(&self, repo: &str) {
        self.state
            .lock()
            .unwrap()
            .repos
            .entry(repo.to_string())
            .or_default();
    }

    pub fn fail_catalog(&self) {
        self.state.lock().unwrap().fail_catalog = true;
    }

    pub fn fail_tags(&self, repo: &str) {
        self.state.lock().unwrap().fail_tags.insert(repo.to_string());
    }

    pub fn fail_digest(&self, repo: &str, tag: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_digest
            .insert((repo.to_string(), tag.to_string()));
    }

    pub fn fail_created(&self, repo: &str, tag: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_created
            .insert((repo.to_string(), tag.to_string()));
    }

    pub fn fail_delete(&self, digest: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_delete
            .insert(digest.to_string());
    }

    /// Make every digest and creation-time lookup take `delay`
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = delay;
    }

    /// Most digest and creation-time lookups seen running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn find(&self, repo: &str, tag: &str) -> Result<(String, DateTime<Utc>)> {
        let state = self.state.lock().unwrap();
        state
            .repos
            .get(repo)
            .and_then(|tags| tags.iter().find(|(t, _, _)| t == tag))
            .map(|(_, digest, created)| (digest.clone(), *created))
            .ok_or_else(|| anyhow!("manifest unknown: {}:{}", repo, tag))
    }

    async fn lookup<T>(&self, f: impl FnOnce() -> Result<T> + Send) -> Result<T> {
        let delay = self.state.lock().unwrap().fetch_delay;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let out = f();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl RegistryAccess for FakeRegistry {
    async fn list_repositories(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_catalog {
            return Err(anyhow!("catalog unavailable"));
        }
        Ok(state.repos.keys().cloned().collect())
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_tags.contains(repo) {
            return Err(anyhow!("tag list unavailable for {}", repo));
        }
        Ok(state
            .repos
            .get(repo)
            .map(|tags| tags.iter().map(|(t, _, _)| t.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_digest_for_tag(&self, repo: &str, tag: &str) -> Result<String> {
        self.lookup(|| {
            let key = (repo.to_string(), tag.to_string());
            if self.state.lock().unwrap().fail_digest.contains(&key) {
                return Err(anyhow!("no digest"));
            }
            Ok(self.find(repo, tag)?.0)
        })
        .await
    }

    async fn get_creation_time(&self, repo: &str, tag: &str) -> Result<DateTime<Utc>> {
        self.lookup(|| {
            let key = (repo.to_string(), tag.to_string());
            if self.state.lock().unwrap().fail_created.contains(&key) {
                return Err(anyhow!("no config blob"));
            }
            Ok(self.find(repo, tag)?.1)
        })
        .await
    }

    async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete.contains(digest) {
            return Err(anyhow!("DELETE returned status 405 Method Not Allowed"));
        }
        state.deleted.push((repo.to_string(), digest.to_string()));
        Ok(())
    }
}

/// Hands out the same fake registry for every connection record
pub struct FakeConnector(pub Arc<FakeRegistry>);

impl RegistryConnector for FakeConnector {
    fn connect(&self, _registry: &Registry) -> Result<Arc<dyn RegistryAccess>> {
        Ok(self.0.clone())
    }
}

/// Scanner returning a canned result, optionally after a delay
pub struct FakeScanner {
    pub name: &'static str,
    pub fail_tags: HashSet<String>,
    pub delay: Duration,
    calls: AtomicUsize,
}

impl FakeScanner {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fail_tags: HashSet::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for FakeScanner {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn scan(&self, _registry_url: &str, repo: &str, tag: &str) -> Result<ScanOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_tags.contains(tag) {
            return Err(anyhow!("image {}:{} could not be pulled", repo, tag));
        }
        Ok(ScanOutput {
            report: format!(r#"{{"Results":[],"ArtifactName":"{}:{}"}}"#, repo, tag),
            summary: r#"{"Critical":0,"High":1,"Medium":0,"Low":0,"Unknown":0}"#.to_string(),
        })
    }
}
