use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// regkeep: retention and scheduled vulnerability scanning for Registry V2
#[derive(Parser, Debug)]
#[command(name = "regkeep", version, about)]
pub struct Cli {
    /// State file holding registries, policies and scan results
    #[arg(long, env = "REGKEEP_STATE", default_value = "data/regkeep.json")]
    pub state: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage registry connections
    #[command(subcommand)]
    Registry(RegistryCommand),

    /// Show, edit and run retention policies
    #[command(subcommand)]
    Retention(RetentionCommand),

    /// Show and edit scheduled scan policies
    #[command(subcommand)]
    ScanPolicy(ScanPolicyCommand),

    /// Scan images and list results
    #[command(subcommand)]
    Scan(ScanCommand),

    /// Run the scan scheduler until interrupted
    Serve(ServeArgs),
}

#[derive(Subcommand, Debug)]
pub enum RegistryCommand {
    /// Register a Registry V2 endpoint
    Add {
        #[arg(long)]
        name: String,

        /// Registry URL (e.g., http://localhost:5000)
        #[arg(long)]
        url: String,

        #[arg(long, env = "REGKEEP_REGISTRY_USER")]
        username: Option<String>,

        #[arg(long, env = "REGKEEP_REGISTRY_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Skip TLS certificate verification
        #[arg(long, default_value_t = false)]
        insecure: bool,
    },

    /// List registered endpoints
    List,

    /// Check that a registry is reachable
    Check {
        #[arg(long)]
        registry_id: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum RetentionCommand {
    Show {
        #[arg(long)]
        registry_id: i64,
    },

    /// Update fields of the retention policy (empty string clears a pattern)
    Set(RetentionSetArgs),

    /// Evaluate the policy and delete what it does not keep
    Run {
        #[arg(long)]
        registry_id: i64,

        /// Override the policy's dry-run setting
        #[arg(long)]
        dry_run: Option<bool>,

        /// Abort on an invalid pattern instead of ignoring that filter
        #[arg(long, default_value_t = false)]
        strict_patterns: bool,

        /// Print the run log as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct RetentionSetArgs {
    #[arg(long)]
    pub registry_id: i64,

    /// Keep N most recent tags per repository (0 disables)
    #[arg(long)]
    pub keep_last: Option<i64>,

    /// Keep tags newer than N days (0 disables)
    #[arg(long)]
    pub keep_days: Option<i64>,

    #[arg(long)]
    pub dry_run: Option<bool>,

    /// Only process repositories matching this regex
    #[arg(long)]
    pub filter_repos: Option<String>,

    /// Skip repositories matching this regex
    #[arg(long)]
    pub exclude_repos: Option<String>,

    /// Never delete tags matching this regex
    #[arg(long)]
    pub exclude_tags: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ScanPolicyCommand {
    Show {
        #[arg(long)]
        registry_id: i64,
    },

    Set {
        #[arg(long)]
        registry_id: i64,

        #[arg(long)]
        enabled: Option<bool>,

        /// Hours between scheduled scans
        #[arg(long)]
        interval_hours: Option<i64>,

        /// Only scan repositories matching this regex
        #[arg(long)]
        filter_repos: Option<String>,

        /// Only scan tags matching this regex
        #[arg(long)]
        filter_tags: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScanCommand {
    /// Scan one image now and record the result
    Run {
        #[arg(long)]
        registry_id: i64,

        #[arg(long)]
        repo: String,

        #[arg(long, default_value = "latest")]
        tag: String,

        #[command(flatten)]
        scanner: ScannerArgs,
    },

    /// Scan every image selected by the registry's scan policy now
    Registry {
        #[arg(long)]
        registry_id: i64,

        /// Number of scan workers
        #[arg(long, env = "REGKEEP_WORKERS", default_value_t = 2)]
        workers: usize,

        #[command(flatten)]
        scanner: ScannerArgs,
    },

    /// List recorded scans for a registry
    List {
        #[arg(long)]
        registry_id: i64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ScannerArgs {
    /// Scanner to use: trivy or osv
    #[arg(long, env = "REGKEEP_SCANNER", default_value = "trivy")]
    pub scanner: String,

    /// Scratch directory for SBOM files
    #[arg(long, env = "REGKEEP_SCRATCH_DIR", default_value = "scan_temp")]
    pub scratch_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Number of scan workers
    #[arg(long, env = "REGKEEP_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Capacity of the scan job queue
    #[arg(long, env = "REGKEEP_QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    /// Seconds between policy checks
    #[arg(long, env = "REGKEEP_TICK_SECS", default_value_t = 60)]
    pub tick_secs: u64,

    /// Seconds to wait for queue space before dropping a job
    #[arg(long, env = "REGKEEP_ENQUEUE_TIMEOUT_SECS", default_value_t = 2)]
    pub enqueue_timeout_secs: u64,

    #[command(flatten)]
    pub scanner: ScannerArgs,
}
