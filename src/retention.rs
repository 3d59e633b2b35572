//! Retention policy evaluation.
//!
//! A run walks every selected repository, resolves each tag to a digest and a
//! creation time, decides what to keep, and only then issues deletions. A
//! manifest is never deleted while any retained tag still points at it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::{ImageCandidate, Registry, RetentionAction, RetentionLog, RetentionPolicy};
use crate::registry::{RegistryAccess, RegistryConnector};

/// Maximum in-flight tag lookups per repository
const FETCH_CONCURRENCY: usize = 5;

const REASON_EXCEEDS: &str = "exceeds retention limits";
const REASON_SHARED: &str = "digest shared with retained tag";
const REASON_NO_POLICY: &str = "no policy set";

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionOptions {
    /// Abort the run on an invalid pattern instead of ignoring that filter
    pub strict_patterns: bool,
}

/// Keep/delete verdict for one tag, before any action is taken
#[derive(Debug, Clone)]
pub struct Decision {
    pub candidate: ImageCandidate,
    pub keep: bool,
    pub reason: String,
}

pub struct RetentionEngine {
    access: Arc<dyn RegistryAccess>,
    options: RetentionOptions,
}

/// Connect to `registry` and evaluate `policy` against it
pub async fn run_retention(
    connector: &dyn RegistryConnector,
    registry: &Registry,
    policy: &RetentionPolicy,
    options: RetentionOptions,
) -> Result<Vec<RetentionLog>> {
    let access = connector.connect(registry)?;
    RetentionEngine::new(access, options).evaluate(policy).await
}

impl RetentionEngine {
    pub fn new(access: Arc<dyn RegistryAccess>, options: RetentionOptions) -> Self {
        Self { access, options }
    }

    pub async fn evaluate(&self, policy: &RetentionPolicy) -> Result<Vec<RetentionLog>> {
        self.evaluate_at(policy, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetentionLog>> {
        let strict = self.options.strict_patterns;
        let filter_repos = compile_pattern("filter_repos", policy.filter_repos.as_deref(), strict)?;
        let exclude_repos =
            compile_pattern("exclude_repos", policy.exclude_repos.as_deref(), strict)?;
        let exclude_tags = compile_pattern("exclude_tags", policy.exclude_tags.as_deref(), strict)?;

        let repos = self
            .access
            .list_repositories()
            .await
            .context("Failed to list repositories")?;

        let mut logs = Vec::new();

        for repo in &repos {
            if !repository_selected(repo, filter_repos.as_ref(), exclude_repos.as_ref()) {
                debug!("Skipping repository {} (filtered)", repo);
                continue;
            }

            match self
                .process_repository(repo, policy, exclude_tags.as_ref(), now)
                .await
            {
                Ok(repo_logs) => logs.extend(repo_logs),
                Err(e) => warn!("Error processing repository {}: {:#}", repo, e),
            }
        }

        info!(
            "Retention run finished: {} tags evaluated across {} repositories",
            logs.len(),
            repos.len()
        );

        Ok(logs)
    }

    async fn process_repository(
        &self,
        repo: &str,
        policy: &RetentionPolicy,
        exclude_tags: Option<&Regex>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetentionLog>> {
        let tags = self.access.list_tags(repo).await?;
        if tags.is_empty() {
            debug!("No tags found for {}", repo);
            return Ok(Vec::new());
        }

        let candidates = self.collect_candidates(repo, &tags, exclude_tags).await?;
        let (decisions, kept_digests) = decide(candidates, policy, now);

        let mut delete_outcomes: HashMap<String, Option<String>> = HashMap::new();
        let mut logs = Vec::with_capacity(decisions.len());

        for decision in decisions {
            let digest = decision.candidate.digest.clone();

            let (action, reason) = if decision.keep {
                (RetentionAction::Kept, decision.reason)
            } else if kept_digests.contains(&digest) {
                (RetentionAction::Kept, REASON_SHARED.to_string())
            } else if policy.dry_run {
                (RetentionAction::WouldDelete, REASON_EXCEEDS.to_string())
            } else {
                // Tags sharing a digest share a single DELETE
                if !delete_outcomes.contains_key(&digest) {
                    let outcome = match self.access.delete_manifest(repo, &digest).await {
                        Ok(()) => {
                            info!("Deleted {}@{}", repo, digest);
                            None
                        }
                        Err(e) => {
                            warn!("Failed to delete {}@{}: {:#}", repo, digest, e);
                            Some(format!("{:#}", e))
                        }
                    };
                    delete_outcomes.insert(digest.clone(), outcome);
                }

                match &delete_outcomes[&digest] {
                    None => (RetentionAction::Deleted, REASON_EXCEEDS.to_string()),
                    Some(err) => (
                        RetentionAction::ErrorDelete,
                        format!("failed to delete: {}", err),
                    ),
                }
            };

            logs.push(RetentionLog {
                repository: repo.to_string(),
                tag: decision.candidate.tag,
                digest,
                created: decision.candidate.created,
                action,
                reason,
            });
        }

        Ok(logs)
    }

    /// Resolve digest and creation time for every tag with bounded concurrency.
    /// Tags missing either value are left out.
    async fn collect_candidates(
        &self,
        repo: &str,
        tags: &[String],
        exclude_tags: Option<&Regex>,
    ) -> Result<Vec<ImageCandidate>> {
        let semaphore = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
        let candidates = Arc::new(Mutex::new(Vec::with_capacity(tags.len())));
        let mut handles = Vec::with_capacity(tags.len());

        for tag in tags {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Fetch semaphore closed")?;
            let access = self.access.clone();
            let candidates = candidates.clone();
            let repo = repo.to_string();
            let tag = tag.clone();
            let protected = exclude_tags.is_some_and(|re| re.is_match(&tag));

            handles.push(tokio::spawn(async move {
                let _permit = permit;

                let created = match access.get_creation_time(&repo, &tag).await {
                    Ok(created) => created,
                    Err(e) => {
                        debug!("Dropping {}:{}: no creation time: {:#}", repo, tag, e);
                        return;
                    }
                };
                let digest = match access.get_digest_for_tag(&repo, &tag).await {
                    Ok(digest) => digest,
                    Err(e) => {
                        debug!("Dropping {}:{}: no digest: {:#}", repo, tag, e);
                        return;
                    }
                };

                candidates.lock().await.push(ImageCandidate {
                    tag,
                    digest,
                    created,
                    protected,
                });
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Tag lookup task for {} failed: {}", repo, e);
            }
        }

        let mut candidates = candidates.lock().await;
        Ok(std::mem::take(&mut *candidates))
    }
}

/// Sort newest first and apply the keep rules in one forward pass.
/// Returns the per-tag decisions and the set of digests held by kept tags.
pub fn decide(
    mut candidates: Vec<ImageCandidate>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> (Vec<Decision>, HashSet<String>) {
    candidates.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.tag.cmp(&b.tag)));

    let no_rules = policy.keep_last_count <= 0 && policy.keep_days <= 0;
    let mut kept_digests = HashSet::new();
    let mut decisions = Vec::with_capacity(candidates.len());

    for (i, candidate) in candidates.into_iter().enumerate() {
        let mut keep = false;
        let mut reason = String::from("default keep");

        if policy.keep_last_count > 0 && (i as i64) < policy.keep_last_count {
            keep = true;
            reason = format!("within last {} images", policy.keep_last_count);
        }

        if policy.keep_days > 0 && (now - candidate.created).num_days() < policy.keep_days {
            if keep {
                reason.push_str(&format!(" AND newer than {} days", policy.keep_days));
            } else {
                keep = true;
                reason = format!("newer than {} days", policy.keep_days);
            }
        }

        if candidate.protected {
            if keep {
                reason.push_str(" AND matches whitelist");
            } else {
                reason = String::from("matches whitelist tag");
            }
            keep = true;
        }

        // Absence of configuration never deletes anything
        if no_rules {
            keep = true;
            reason = REASON_NO_POLICY.to_string();
        }

        if keep {
            kept_digests.insert(candidate.digest.clone());
        }
        decisions.push(Decision {
            candidate,
            keep,
            reason,
        });
    }

    (decisions, kept_digests)
}

/// Compile an optional policy pattern. Empty patterns mean "no filter".
pub(crate) fn compile_pattern(
    field: &'static str,
    pattern: Option<&str>,
    strict: bool,
) -> Result<Option<Regex>, AppError> {
    let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
        return Ok(None);
    };

    match Regex::new(pattern) {
        Ok(re) => Ok(Some(re)),
        Err(source) if strict => Err(AppError::InvalidPattern { field, source }),
        Err(e) => {
            warn!("Invalid {} pattern {:?}, filter disabled: {}", field, pattern, e);
            Ok(None)
        }
    }
}

fn repository_selected(repo: &str, include: Option<&Regex>, exclude: Option<&Regex>) -> bool {
    if include.is_some_and(|re| !re.is_match(repo)) {
        return false;
    }
    !exclude.is_some_and(|re| re.is_match(repo))
}
