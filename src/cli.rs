//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Limes - multi-tenant quota and capacity accounting
///
/// The `collect` subcommand runs the scraper fleet, `serve` runs the REST
/// API, and the `test-*` subcommands invoke one driver call and print the
/// result as indented JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum TracingFormat {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
}

#[cfg(debug_assertions)]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Pretty;
#[cfg(not(debug_assertions))]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Json;

fn default_tracing_format() -> TracingFormat {
    DEFAULT_TRACING_FORMAT
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run all collector loops and the metrics endpoint
    Collect {
        /// Path to the configuration file
        config: PathBuf,
        /// Cluster id to operate on
        cluster: String,
    },
    /// Run the REST API
    Serve {
        config: PathBuf,
        cluster: String,
    },
    /// Scrape one project's quota/usage once and print the result
    TestGetQuota {
        config: PathBuf,
        cluster: String,
        /// Service type whose driver is invoked
        #[arg(long)]
        service: String,
        /// Project uuid
        #[arg(long)]
        project: String,
    },
    /// Scrape one project's rates once and print the result
    TestGetRates {
        config: PathBuf,
        cluster: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        project: String,
        /// Opaque state from a previous call; empty means "no history"
        #[arg(long, default_value = "")]
        prev_state: String,
    },
    /// Push quota values for one project once
    TestSetQuota {
        config: PathBuf,
        cluster: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        project: String,
        /// Quota values as name=value pairs
        #[arg(required = true)]
        quotas: Vec<String>,
    },
    /// Run one capacity scrape and print the result
    TestScanCapacity {
        config: PathBuf,
        cluster: String,
        /// Capacitor id whose driver is invoked
        #[arg(long)]
        capacitor: String,
    },
}

impl Command {
    /// Config path and cluster id, common to every subcommand.
    pub fn scope(&self) -> (&PathBuf, &str) {
        match self {
            Command::Collect { config, cluster }
            | Command::Serve { config, cluster }
            | Command::TestGetQuota { config, cluster, .. }
            | Command::TestGetRates { config, cluster, .. }
            | Command::TestSetQuota { config, cluster, .. }
            | Command::TestScanCapacity { config, cluster, .. } => (config, cluster),
        }
    }
}

/// Parse a "name=value" quota argument.
pub fn parse_quota_pair(raw: &str) -> crate::error::Result<(String, u64)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected name=value, got {raw:?}"))?;
    let value: u64 = value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid quota value in {raw:?}: {e}"))?;
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quota_pair() {
        assert_eq!(parse_quota_pair("cores=20").unwrap(), ("cores".into(), 20));
        assert!(parse_quota_pair("cores").is_err());
        assert!(parse_quota_pair("cores=lots").is_err());
    }

    #[test]
    fn test_scope_extraction() {
        let args = Args::parse_from(["limes", "collect", "/etc/limes.yaml", "west"]);
        let (config, cluster) = args.command.scope();
        assert_eq!(config.to_str(), Some("/etc/limes.yaml"));
        assert_eq!(cluster, "west");
    }

    #[test]
    fn test_set_quota_requires_pairs() {
        assert!(
            Args::try_parse_from(["limes", "test-set-quota", "c.yaml", "west", "--service", "compute", "--project", "p1"])
                .is_err()
        );
    }
}
