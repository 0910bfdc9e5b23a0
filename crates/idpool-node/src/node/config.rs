use anyhow::{anyhow, bail};
use clap::Parser;
use core::{str::FromStr, time::Duration};
use idpool::{CoordinatorConfig, DEFAULT_QUARANTINE_DELAY_SECS, RetryPolicy};
use std::collections::HashSet;

/// Runtime configuration for the `idpool-node` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults suitable for a local cluster
/// member.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "idpool-node",
    version,
    about = "Runs one idpool allocation node with in-memory collaborators"
)]
pub struct CliArgs {
    /// Identity of this node within the cluster.
    ///
    /// Names this node's child pool under every global pool, so it must be
    /// unique across nodes sharing a store.
    ///
    /// Environment variable: `NODE_ID`
    #[arg(long, env = "NODE_ID", default_value_t = String::from("node-0"))]
    pub node_id: String,

    /// Seconds a released id waits before it can be handed out again.
    ///
    /// Stamped on pools created by this node; existing pools keep their own.
    ///
    /// Environment variable: `QUARANTINE_DELAY_SECS`
    #[arg(long, env = "QUARANTINE_DELAY_SECS", default_value_t = DEFAULT_QUARANTINE_DELAY_SECS)]
    pub quarantine_delay_secs: u64,

    /// Seconds a sibling node may sit untouched before its capacity can be
    /// reclaimed by an exhausted pool.
    ///
    /// Environment variable: `IDLE_THRESHOLD_SECS`
    #[arg(long, env = "IDLE_THRESHOLD_SECS", default_value_t = 24 * 60 * 60)]
    pub idle_threshold_secs: u64,

    /// Upper bound, in seconds, a release waits for an in-flight allocation
    /// of the same key to persist.
    ///
    /// Environment variable: `RELEASE_WAIT_SECS`
    #[arg(long, env = "RELEASE_WAIT_SECS", default_value_t = 10)]
    pub release_wait_secs: u64,

    /// Retries for a failed persistence job before it is dropped.
    ///
    /// Environment variable: `JOB_MAX_RETRIES`
    #[arg(long, env = "JOB_MAX_RETRIES", default_value_t = 3)]
    pub job_max_retries: u32,

    /// Seconds between pool statistics reports.
    ///
    /// Environment variable: `STATS_INTERVAL_SECS`
    #[arg(long, env = "STATS_INTERVAL_SECS", default_value_t = 30)]
    pub stats_interval_secs: u64,

    /// Pool to create on startup, as `name=low..high` (both bounds
    /// inclusive). Repeat the flag for several pools.
    ///
    /// Example: `--pool users=1..100000`
    ///
    /// Environment variable: `POOLS` (comma separated)
    #[arg(long = "pool", env = "POOLS", value_delimiter = ',')]
    pub pools: Vec<PoolSpec>,
}

/// A pool requested on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub low: u64,
    pub high: u64,
}

impl FromStr for PoolSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, range) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected `name=low..high`, got `{s}`"))?;
        let (low, high) = range
            .split_once("..")
            .ok_or_else(|| anyhow!("expected `low..high` for pool `{name}`, got `{range}`"))?;

        let name = name.trim();
        if name.is_empty() {
            bail!("pool name must not be empty");
        }
        let low: u64 = low
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid low bound for pool `{name}`: {e}"))?;
        let high: u64 = high
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid high bound for pool `{name}`: {e}"))?;
        if low > high {
            bail!("pool `{name}` has low ({low}) greater than high ({high})");
        }

        Ok(Self {
            name: name.to_owned(),
            low,
            high,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub coordinator: CoordinatorConfig,
    pub pools: Vec<PoolSpec>,
    pub stats_interval: Duration,
}

impl TryFrom<CliArgs> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let node_id = args.node_id.trim();
        if node_id.is_empty() {
            bail!("NODE_ID must not be empty");
        }
        if node_id.contains('/') {
            bail!("NODE_ID ({node_id}) must not contain '/'");
        }

        if args.stats_interval_secs == 0 {
            bail!("STATS_INTERVAL_SECS must be greater than 0");
        }

        let mut seen = HashSet::new();
        for pool in &args.pools {
            if !seen.insert(pool.name.as_str()) {
                bail!("pool `{}` is configured more than once", pool.name);
            }
        }

        let jobs = RetryPolicy {
            max_retries: args.job_max_retries,
            ..RetryPolicy::default()
        };
        let coordinator = CoordinatorConfig::new(node_id)
            .with_quarantine_delay(Duration::from_secs(args.quarantine_delay_secs))
            .with_idle_threshold(Duration::from_secs(args.idle_threshold_secs))
            .with_release_wait(Duration::from_secs(args.release_wait_secs))
            .with_retry_policy(jobs);

        Ok(Self {
            coordinator,
            pools: args.pools,
            stats_interval: Duration::from_secs(args.stats_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(core::iter::once("idpool-node").chain(argv.iter().copied()))
            .unwrap()
    }

    #[test]
    fn pool_spec_parses_inclusive_bounds() {
        let spec: PoolSpec = "users=1..100".parse().unwrap();
        assert_eq!(
            spec,
            PoolSpec {
                name: "users".into(),
                low: 1,
                high: 100,
            }
        );

        let single: PoolSpec = " one = 7 .. 7 ".parse().unwrap();
        assert_eq!((single.name.as_str(), single.low, single.high), ("one", 7, 7));
    }

    #[test]
    fn malformed_pool_specs_are_rejected() {
        for bad in ["users", "users=1-100", "=1..2", "users=a..2", "users=1..", "users=9..1"] {
            assert!(bad.parse::<PoolSpec>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn pool_flag_is_repeatable() {
        let args = parse(&["--pool", "a=0..9", "--pool", "b=10..19"]);
        let names: Vec<_> = args.pools.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn cli_values_reach_the_coordinator_config() {
        let args = parse(&[
            "--node-id",
            "node-7",
            "--quarantine-delay-secs",
            "5",
            "--idle-threshold-secs",
            "60",
            "--release-wait-secs",
            "2",
            "--job-max-retries",
            "9",
            "--stats-interval-secs",
            "1",
        ]);
        let config = NodeConfig::try_from(args).unwrap();

        assert_eq!(config.coordinator.node_id, "node-7");
        assert_eq!(config.coordinator.quarantine_delay, Duration::from_secs(5));
        assert_eq!(config.coordinator.idle_threshold, Duration::from_secs(60));
        assert_eq!(config.coordinator.release_wait, Duration::from_secs(2));
        assert_eq!(config.coordinator.jobs.max_retries, 9);
        assert_eq!(config.stats_interval, Duration::from_secs(1));
        assert!(config.pools.is_empty());
    }

    #[test]
    fn invalid_settings_fail_validation() {
        let zero_interval = parse(&["--stats-interval-secs", "0"]);
        assert!(NodeConfig::try_from(zero_interval).is_err());

        let blank_node = parse(&["--node-id", "  "]);
        assert!(NodeConfig::try_from(blank_node).is_err());

        let nested_node = parse(&["--node-id", "a/b"]);
        assert!(NodeConfig::try_from(nested_node).is_err());

        let duplicate = parse(&["--pool", "a=0..9", "--pool", "a=10..19"]);
        assert!(NodeConfig::try_from(duplicate).is_err());
    }
}
