mod cli;
mod error;
mod models;
mod output;
mod registry;
mod retention;
mod scanner;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{
    Cli, Command, RegistryCommand, RetentionCommand, RetentionSetArgs, ScanCommand,
    ScanPolicyCommand, ScannerArgs, ServeArgs,
};
use models::Registry;
use output::{
    print_registries, print_retention_logs, print_retention_policy, print_retention_summary,
    print_scan_policy, print_scans, RetentionTally,
};
use registry::{HttpConnector, RegistryAccess, RegistryClient};
use retention::{run_retention, RetentionOptions};
use scanner::scanner_by_name;
use scheduler::{Enqueued, ScanJob, Scheduler, SchedulerConfig};
use store::{JsonStore, PolicyStore};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "regkeep=debug" } else { "regkeep=info" };
    let filter = EnvFilter::try_from_env("REGKEEP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let store = Arc::new(JsonStore::open(&cli.state).await?);

    match cli.command {
        Command::Registry(cmd) => run_registry(store.as_ref(), cmd).await,
        Command::Retention(cmd) => run_retention_command(store.as_ref(), cmd).await,
        Command::ScanPolicy(cmd) => run_scan_policy(store.as_ref(), cmd).await,
        Command::Scan(cmd) => run_scan(store, cmd).await,
        Command::Serve(args) => serve(store, args).await,
    }
}

async fn run_registry(store: &dyn PolicyStore, cmd: RegistryCommand) -> Result<()> {
    match cmd {
        RegistryCommand::Add {
            name,
            url,
            username,
            password,
            insecure,
        } => {
            let registry = store
                .add_registry(Registry {
                    id: 0,
                    name,
                    url: url.trim_end_matches('/').to_string(),
                    username,
                    password,
                    insecure,
                    created_at: Utc::now(),
                })
                .await?;
            println!("Registered {} as #{}", registry.url, registry.id);
        }
        RegistryCommand::List => print_registries(&store.list_registries().await?),
        RegistryCommand::Check { registry_id } => {
            let registry = store.get_registry(registry_id).await?;
            RegistryClient::from_registry(&registry)?
                .ping()
                .await
                .with_context(|| format!("Registry {} is not reachable", registry.url))?;
            println!("{} is reachable.", registry.url);
        }
    }
    Ok(())
}

async fn run_retention_command(store: &dyn PolicyStore, cmd: RetentionCommand) -> Result<()> {
    match cmd {
        RetentionCommand::Show { registry_id } => {
            print_retention_policy(&store.get_retention_policy(registry_id).await?);
        }
        RetentionCommand::Set(args) => {
            let policy = apply_retention_args(store.get_retention_policy(args.registry_id).await?, args);
            store.save_retention_policy(policy.clone()).await?;
            print_retention_policy(&policy);
        }
        RetentionCommand::Run {
            registry_id,
            dry_run,
            strict_patterns,
            json,
        } => {
            let registry = store.get_registry(registry_id).await?;
            let mut policy = store.get_retention_policy(registry_id).await?;
            if let Some(dry_run) = dry_run {
                policy.dry_run = dry_run;
            }

            let logs = run_retention(
                &HttpConnector,
                &registry,
                &policy,
                RetentionOptions { strict_patterns },
            )
            .await
            .context("Retention run failed")?;

            if !policy.dry_run {
                store.mark_retention_run(registry_id, Utc::now()).await?;
            }

            let tally = RetentionTally::from_logs(&logs);
            if json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else {
                print_retention_logs(&logs, policy.dry_run);
                print_retention_summary(tally, policy.dry_run);
            }

            if tally.errors > 0 {
                anyhow::bail!("{} deletions failed", tally.errors);
            }
        }
    }
    Ok(())
}

fn empty_as_none(value: String) -> Option<String> {
    Some(value).filter(|v| !v.is_empty())
}

fn apply_retention_args(
    mut policy: models::RetentionPolicy,
    args: RetentionSetArgs,
) -> models::RetentionPolicy {
    if let Some(n) = args.keep_last {
        policy.keep_last_count = n;
    }
    if let Some(days) = args.keep_days {
        policy.keep_days = days;
    }
    if let Some(dry_run) = args.dry_run {
        policy.dry_run = dry_run;
    }
    if let Some(p) = args.filter_repos {
        policy.filter_repos = empty_as_none(p);
    }
    if let Some(p) = args.exclude_repos {
        policy.exclude_repos = empty_as_none(p);
    }
    if let Some(p) = args.exclude_tags {
        policy.exclude_tags = empty_as_none(p);
    }
    policy
}

async fn run_scan_policy(store: &dyn PolicyStore, cmd: ScanPolicyCommand) -> Result<()> {
    match cmd {
        ScanPolicyCommand::Show { registry_id } => {
            print_scan_policy(&store.get_scan_policy(registry_id).await?);
        }
        ScanPolicyCommand::Set {
            registry_id,
            enabled,
            interval_hours,
            filter_repos,
            filter_tags,
        } => {
            store.get_registry(registry_id).await?;
            let mut policy = store.get_scan_policy(registry_id).await?;
            if let Some(enabled) = enabled {
                policy.enabled = enabled;
            }
            if let Some(hours) = interval_hours {
                policy.interval_hours = hours;
                // Reschedule from the last run with the new interval
                policy.next_run_at = policy.last_run_at.map(|last| last + policy.interval());
            }
            if let Some(p) = filter_repos {
                policy.filter_repos = empty_as_none(p);
            }
            if let Some(p) = filter_tags {
                policy.filter_tags = empty_as_none(p);
            }
            print_scan_policy(&store.save_scan_policy(policy).await?);
        }
    }
    Ok(())
}

async fn run_scan(store: Arc<JsonStore>, cmd: ScanCommand) -> Result<()> {
    match cmd {
        ScanCommand::Run {
            registry_id,
            repo,
            tag,
            scanner,
        } => {
            let registry = store.get_registry(registry_id).await?;
            let digest = match RegistryClient::from_registry(&registry)?
                .get_digest_for_tag(&repo, &tag)
                .await
            {
                Ok(digest) => Some(digest),
                Err(e) => {
                    debug!("No digest for {}:{}: {:#}", repo, tag, e);
                    None
                }
            };

            let mut scheduler = one_shot_scheduler(store.clone(), &scanner, 1)?;
            scheduler.start_workers()?;
            let job = ScanJob {
                registry_url: registry.url,
                registry_id,
                repo: repo.clone(),
                tag: tag.clone(),
                digest,
            };
            let queued = scheduler.submit(job).await;
            scheduler.stop().await;
            if queued != Enqueued::Queued {
                anyhow::bail!("Scan of {}:{} was not queued ({:?})", repo, tag, queued);
            }

            let scan = store
                .get_scan(registry_id, &repo, &tag)
                .await?
                .with_context(|| format!("No scan recorded for {}:{}", repo, tag))?;
            print_scans(std::slice::from_ref(&scan));
        }
        ScanCommand::Registry {
            registry_id,
            workers,
            scanner,
        } => {
            let policy = store.get_scan_policy(registry_id).await?;
            let mut scheduler = one_shot_scheduler(store.clone(), &scanner, workers)?;
            scheduler.start_workers()?;
            let dispatched = scheduler.dispatch(&policy).await;
            scheduler.stop().await;

            println!(
                "Queued {} images for registry {}",
                dispatched?,
                registry_id
            );
            print_scans(&store.list_scans(registry_id).await?);
        }
        ScanCommand::List { registry_id } => print_scans(&store.list_scans(registry_id).await?),
    }
    Ok(())
}

/// Scheduler for a single command: workers only, no policy ticker
fn one_shot_scheduler(
    store: Arc<JsonStore>,
    scanner: &ScannerArgs,
    workers: usize,
) -> Result<Scheduler> {
    let scanner = scanner_by_name(&scanner.scanner, scanner.scratch_dir.clone())?;
    let config = SchedulerConfig {
        workers,
        ..SchedulerConfig::default()
    };
    Ok(Scheduler::new(store, Arc::new(HttpConnector), scanner, config))
}

async fn serve(store: Arc<JsonStore>, args: ServeArgs) -> Result<()> {
    let scanner = scanner_by_name(&args.scanner.scanner, args.scanner.scratch_dir)?;
    let config = SchedulerConfig {
        workers: args.workers,
        queue_capacity: args.queue_capacity,
        tick: Duration::from_secs(args.tick_secs.max(1)),
        enqueue_timeout: Duration::from_secs(args.enqueue_timeout_secs),
    };

    let mut scheduler = Scheduler::new(store, Arc::new(HttpConnector), scanner, config);
    scheduler.start()?;

    // Policies already due should not wait for the first tick
    match scheduler.check_schedules(Utc::now()).await {
        Ok(triggered) => info!("{} scan policies due at startup", triggered.len()),
        Err(e) => warn!("Initial schedule check failed: {:#}", e),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down...");

    scheduler.stop().await;
    info!(
        "Scan scheduler {:?}, {} jobs queued in total",
        scheduler.state(),
        scheduler.queued_total()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_args(registry_id: i64) -> RetentionSetArgs {
        RetentionSetArgs {
            registry_id,
            keep_last: None,
            keep_days: None,
            dry_run: None,
            filter_repos: None,
            exclude_repos: None,
            exclude_tags: None,
        }
    }

    #[test]
    fn test_apply_retention_args_only_touches_given_fields() {
        let base = models::RetentionPolicy::default_for(1);
        let policy = apply_retention_args(
            base.clone(),
            RetentionSetArgs {
                keep_days: Some(14),
                exclude_tags: Some(String::new()),
                ..set_args(1)
            },
        );

        assert_eq!(policy.keep_last_count, base.keep_last_count);
        assert_eq!(policy.keep_days, 14);
        assert!(policy.dry_run);
        assert_eq!(policy.exclude_tags, None);
    }
}
