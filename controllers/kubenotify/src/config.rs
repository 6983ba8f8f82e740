//! Command line and environment configuration.
//!
//! [`Args`] is what the user typed; [`Options`] is the validated value the
//! controller is built from. List flags accept comma separated values, and
//! most flags fall back to a `KUBENOTIFY_*` environment variable.

use crate::change::{DEFAULT_TIME_FORMAT, FilterSet};
use crate::duration::parse_duration;
use crate::error::ControllerError;
use crate::model::WorkloadKind;
use chrono::TimeDelta;
use chrono::format::{Item, StrftimeItems};
use clap::{ArgAction, Parser};
use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

/// Watch workloads, report filtered changes and diagnose stuck rollouts
#[derive(Parser, Debug, Clone)]
#[command(name = "kubenotify", version, about)]
pub struct Args {
    /// Workload kinds to watch
    #[arg(
        long,
        env = "KUBENOTIFY_RESOURCES",
        value_delimiter = ',',
        default_values = ["deployments", "statefulsets", "daemonsets"]
    )]
    pub resources: Vec<String>,

    /// Only report objects in these namespaces (default: all)
    #[arg(long, env = "KUBENOTIFY_NAMESPACES", value_delimiter = ',')]
    pub namespaces: Vec<String>,

    /// Replace the default exclude patterns
    #[arg(
        long = "set-excludes",
        env = "KUBENOTIFY_EXCLUDES",
        value_delimiter = ',',
        default_values = ["^metadata\\.", "^status\\."]
    )]
    pub excludes: Vec<String>,

    /// Exclude patterns added to the defaults
    #[arg(long = "add-excludes", env = "KUBENOTIFY_EXTRA_EXCLUDES", value_delimiter = ',')]
    pub extra_excludes: Vec<String>,

    /// Only report paths matching one of these patterns
    #[arg(long, env = "KUBENOTIFY_INCLUDES", value_delimiter = ',')]
    pub includes: Vec<String>,

    /// Webhook URLs to post notifications to (default: stdout)
    #[arg(long, env = "KUBENOTIFY_WEBHOOKS", value_delimiter = ',')]
    pub webhooks: Vec<String>,

    /// Creations older than this are treated as cache replays
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub ignore_created_before: Duration,

    /// First retry delay of a readiness check
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub init_backoff: Duration,

    /// Longest retry delay of a readiness check
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    pub max_backoff: Duration,

    /// Retries before a readiness check is dropped
    #[arg(long, default_value_t = 10)]
    pub max_retries: u32,

    /// Concurrent readiness workers
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// strftime format of message timestamps
    #[arg(long, default_value = DEFAULT_TIME_FORMAT)]
    pub time_format: String,

    /// Debug logging, and resource versions in messages
    #[arg(long, action = ArgAction::SetTrue)]
    pub debug: bool,

    /// Do not age StatefulSets by their update revision
    #[arg(long, action = ArgAction::SetTrue)]
    pub disable_revision: bool,

    /// Address of the probe and metrics server (disabled when unset)
    #[arg(long, env = "KUBENOTIFY_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// Validated controller configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub resources: BTreeSet<WorkloadKind>,
    pub namespaces: HashSet<String>,
    pub filters: FilterSet,
    pub ignore_created_before: TimeDelta,
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
    pub workers: usize,
    pub time_format: String,
    pub debug: bool,
    pub enable_revision: bool,
    pub webhooks: Vec<String>,
    pub metrics_addr: Option<SocketAddr>,
}

impl Options {
    /// Whether `kind` is watched.
    #[must_use]
    pub fn watches(&self, kind: WorkloadKind) -> bool {
        self.resources.contains(&kind)
    }

    /// Watched kinds, in [`WorkloadKind::ALL`] order.
    pub fn watched_kinds(&self) -> impl Iterator<Item = WorkloadKind> + '_ {
        WorkloadKind::ALL.into_iter().filter(|kind| self.watches(*kind))
    }
}

fn non_empty(values: Vec<String>) -> impl Iterator<Item = String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_time_format(format: &str) -> Result<(), ControllerError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ControllerError::InvalidConfig(format!(
            "invalid time format: {format:?}"
        )));
    }
    Ok(())
}

impl TryFrom<Args> for Options {
    type Error = ControllerError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let resources = non_empty(args.resources)
            .map(|r| r.parse::<WorkloadKind>())
            .collect::<Result<BTreeSet<WorkloadKind>, _>>()?;
        if resources.is_empty() {
            return Err(ControllerError::InvalidConfig("no resources to watch".to_string()));
        }

        let excludes: Vec<String> = non_empty(args.excludes).chain(non_empty(args.extra_excludes)).collect();
        let includes: Vec<String> = non_empty(args.includes).collect();
        let filters = FilterSet::compile(&excludes, &includes)?;

        if args.workers == 0 {
            return Err(ControllerError::InvalidConfig("workers must be at least 1".to_string()));
        }
        if args.init_backoff > args.max_backoff {
            return Err(ControllerError::InvalidConfig(format!(
                "init backoff {:?} exceeds max backoff {:?}",
                args.init_backoff, args.max_backoff
            )));
        }
        validate_time_format(&args.time_format)?;

        let ignore_created_before = TimeDelta::from_std(args.ignore_created_before)
            .map_err(|e| ControllerError::InvalidConfig(format!("ignore window: {e}")))?;

        Ok(Self {
            resources,
            namespaces: non_empty(args.namespaces).collect(),
            filters,
            ignore_created_before,
            init_backoff: args.init_backoff,
            max_backoff: args.max_backoff,
            max_retries: args.max_retries,
            workers: args.workers,
            time_format: args.time_format,
            debug: args.debug,
            enable_revision: !args.disable_revision,
            webhooks: non_empty(args.webhooks).collect(),
            metrics_addr: args.metrics_addr,
        })
    }
}
