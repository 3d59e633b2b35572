use colored::Colorize;

use crate::models::{
    Registry, RetentionAction, RetentionLog, RetentionPolicy, ScanPolicy, ScanStatus,
    VulnerabilityScan,
};

/// Tally of a retention run's actions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionTally {
    pub kept: usize,
    pub would_delete: usize,
    pub deleted: usize,
    pub errors: usize,
}

impl RetentionTally {
    pub fn from_logs(logs: &[RetentionLog]) -> Self {
        let mut tally = Self::default();
        for log in logs {
            match log.action {
                RetentionAction::Kept => tally.kept += 1,
                RetentionAction::WouldDelete => tally.would_delete += 1,
                RetentionAction::Deleted => tally.deleted += 1,
                RetentionAction::ErrorDelete => tally.errors += 1,
            }
        }
        tally
    }
}

/// Print the per-repository outcome of a retention run
pub fn print_retention_logs(logs: &[RetentionLog], dry_run: bool) {
    let mut current: Option<&str> = None;

    for log in logs {
        if current != Some(log.repository.as_str()) {
            current = Some(&log.repository);
            let header = if dry_run {
                format!(" {} ", "DRY RUN".yellow().bold())
            } else {
                String::new()
            };
            println!("\n{}Repository: {}", header, log.repository.bold());
            println!("{}", "─".repeat(60));
        }
        print_log_line(log);
    }

    if logs.is_empty() {
        println!("{}", "No tags matched the policy.".green());
    }
}

fn print_log_line(log: &RetentionLog) {
    let label = match log.action {
        RetentionAction::Kept => "        KEPT".green().bold(),
        RetentionAction::WouldDelete => "WOULD DELETE".yellow().bold(),
        RetentionAction::Deleted => "     DELETED".red().bold(),
        RetentionAction::ErrorDelete => "       ERROR".red().bold(),
    };

    println!(
        "    [{}] {:<30} {} {} {}",
        label,
        log.tag,
        truncate_digest(&log.digest).dimmed(),
        log.created.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed(),
        log.reason,
    );
}

pub fn truncate_digest(digest: &str) -> &str {
    digest.get(..19).unwrap_or(digest)
}

/// Print final summary
pub fn print_retention_summary(tally: RetentionTally, dry_run: bool) {
    let errors = if tally.errors > 0 {
        tally.errors.to_string().red().bold().to_string()
    } else {
        tally.errors.to_string()
    };

    println!("\n{}", "═".repeat(60));
    if dry_run {
        println!(
            "{} Would delete {} tags, keep {} tags",
            "DRY RUN SUMMARY:".yellow().bold(),
            tally.would_delete.to_string().red().bold(),
            tally.kept.to_string().green().bold(),
        );
    } else {
        println!(
            "{} Deleted {} tags, kept {} tags, {} errors",
            "SUMMARY:".bold(),
            tally.deleted.to_string().red().bold(),
            tally.kept.to_string().green().bold(),
            errors
        );
        if tally.deleted > 0 {
            println!(
                "\n{} Run registry garbage collection to reclaim disk space:",
                "REMINDER:".yellow().bold()
            );
            println!("  docker exec <registry-container> bin/registry garbage-collect /etc/docker/registry/config.yml");
        }
    }
}

pub fn print_registries(registries: &[Registry]) {
    if registries.is_empty() {
        println!("No registries configured.");
        return;
    }
    for r in registries {
        println!(
            "  {:>3}  {:<20} {}{}",
            r.id,
            r.name.bold(),
            r.url,
            if r.insecure {
                " (insecure)".yellow().to_string()
            } else {
                String::new()
            }
        );
    }
}

fn or_none(value: &Option<String>) -> String {
    match value.as_deref() {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => "-".dimmed().to_string(),
    }
}

pub fn print_retention_policy(policy: &RetentionPolicy) {
    println!("Retention policy for registry {}", policy.registry_id);
    println!("  keep last:     {}", policy.keep_last_count);
    println!("  keep days:     {}", policy.keep_days);
    println!("  dry run:       {}", policy.dry_run);
    println!("  filter repos:  {}", or_none(&policy.filter_repos));
    println!("  exclude repos: {}", or_none(&policy.exclude_repos));
    println!("  exclude tags:  {}", or_none(&policy.exclude_tags));
    if let Some(at) = policy.last_run_at {
        println!("  last run:      {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
}

pub fn print_scan_policy(policy: &ScanPolicy) {
    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| match t {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "-".dimmed().to_string(),
    };

    println!("Scan policy for registry {}", policy.registry_id);
    println!(
        "  enabled:       {}",
        if policy.enabled {
            "yes".green().bold()
        } else {
            "no".dimmed()
        }
    );
    println!("  interval:      {}h", policy.interval().num_hours());
    println!("  filter repos:  {}", or_none(&policy.filter_repos));
    println!("  filter tags:   {}", or_none(&policy.filter_tags));
    println!("  last run:      {}", fmt_time(policy.last_run_at));
    println!("  next run:      {}", fmt_time(policy.next_run_at));
}

pub fn print_scans(scans: &[VulnerabilityScan]) {
    if scans.is_empty() {
        println!("No scans recorded.");
        return;
    }
    for scan in scans {
        let status = match scan.status {
            ScanStatus::Scanning => scan.status.to_string().yellow(),
            ScanStatus::Completed => scan.status.to_string().green(),
            ScanStatus::Failed => scan.status.to_string().red(),
        };
        println!(
            "  {:<40} {:<10} {} {}",
            format!("{}:{}", scan.repository, scan.tag),
            status,
            scan.scanned_at
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string()
                .dimmed(),
            scan.summary
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn log(action: RetentionAction) -> RetentionLog {
        RetentionLog {
            repository: "app".to_string(),
            tag: "v1".to_string(),
            digest: "sha256:abc".to_string(),
            created: Utc::now(),
            action,
            reason: String::new(),
        }
    }

    #[test]
    fn test_tally_counts_actions() {
        let logs = vec![
            log(RetentionAction::Kept),
            log(RetentionAction::Kept),
            log(RetentionAction::Deleted),
            log(RetentionAction::ErrorDelete),
            log(RetentionAction::WouldDelete),
        ];
        assert_eq!(
            RetentionTally::from_logs(&logs),
            RetentionTally {
                kept: 2,
                would_delete: 1,
                deleted: 1,
                errors: 1,
            }
        );
    }

    #[test]
    fn test_truncate_digest() {
        assert_eq!(
            truncate_digest("sha256:0123456789abcdef0123"),
            "sha256:0123456789ab"
        );
        assert_eq!(truncate_digest("sha256:ab"), "sha256:ab");
    }
}
