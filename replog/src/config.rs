//! Raft runtime configuration.

use std::time::Duration;

use clap::ArgAction;
use clap::Parser;
use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// The runtime configuration for a Raft node.
///
/// All durations are in milliseconds.
///
/// Remember this inequality from the Raft paper when tuning the timing options:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`. Keep the election timeout high enough that the
/// performance of your network will not cause election timeouts, but not so high that a real
/// leader crash causes a prolonged downtime.
///
/// Every option can be given as a command line argument or as an environment variable, e.g.
/// `--heartbeat-interval=100` or `RAFT_HEARTBEAT_INTERVAL=100`.
#[derive(Clone, Debug, Serialize, Deserialize, Parser)]
pub struct Config {
    /// The application specific name of this Raft cluster
    #[clap(long, env = "RAFT_CLUSTER_NAME", default_value = "foo")]
    pub cluster_name: String,

    /// The base election timeout.
    ///
    /// A follower which hears nothing from a leader for this long starts an election. Every time the
    /// timer is armed the actual timeout is drawn uniformly from `[election_timeout, 2 * election_timeout)`.
    #[clap(long, env = "RAFT_ELECTION_TIMEOUT", default_value = "250")]
    pub election_timeout: u64,

    /// The interval at which a leader sends heartbeats to followers
    #[clap(long, env = "RAFT_HEARTBEAT_INTERVAL", default_value = "50")]
    pub heartbeat_interval: u64,

    /// The commit nudge interval.
    ///
    /// When a leader has been idle for this long and a follower has not been told the latest commit
    /// index, an AppendEntries is sent to it right away instead of waiting for the next heartbeat.
    /// It has to be shorter than `heartbeat_interval`.
    #[clap(long, env = "RAFT_COMMIT_TIMEOUT", default_value = "10")]
    pub commit_timeout: u64,

    /// The maximum number of entries sent in a single AppendEntries request
    #[clap(long, env = "RAFT_MAX_APPEND_ENTRIES", default_value = "64")]
    pub max_append_entries: u64,

    /// The number of log entries kept before the last snapshot point.
    ///
    /// A follower that lags behind less than this can be caught up by AppendEntries instead of a
    /// snapshot transfer.
    #[clap(long, env = "RAFT_TRAILING_LOGS", default_value = "1024")]
    pub trailing_logs: u64,

    /// The base interval of the snapshot check.
    ///
    /// The actual interval is drawn uniformly from `[snapshot_interval, 2 * snapshot_interval)`.
    #[clap(long, env = "RAFT_SNAPSHOT_INTERVAL", default_value = "150000")]
    pub snapshot_interval: u64,

    /// The number of applied entries since the last snapshot which triggers a new snapshot
    #[clap(long, env = "RAFT_SNAPSHOT_THRESHOLD", default_value = "8192")]
    pub snapshot_threshold: u64,

    /// The timeout for sending a snapshot to a follower
    #[clap(long, env = "RAFT_INSTALL_SNAPSHOT_TIMEOUT", default_value = "1000")]
    pub install_snapshot_timeout: u64,

    /// Allow a node without peers to become the leader of a single-node cluster without an election
    #[clap(long, env = "RAFT_ENABLE_SINGLE_NODE")]
    pub enable_single_node: bool,

    /// Shut the node down once a config that removes it is committed.
    ///
    /// Otherwise the node falls back to a follower without peers.
    #[clap(long, env = "RAFT_SHUTDOWN_ON_REMOVE", default_value_t = true, action = ArgAction::Set)]
    pub shutdown_on_remove: bool,
}

impl Default for Config {
    fn default() -> Self {
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl Config {
    /// Generate a new random election timeout in `[election_timeout, 2 * election_timeout)`.
    pub fn new_rand_election_timeout(&self) -> Duration {
        Duration::from_millis(rand_in_base_range(self.election_timeout))
    }

    /// Generate a new random snapshot check interval in `[snapshot_interval, 2 * snapshot_interval)`.
    pub fn new_rand_snapshot_interval(&self) -> Duration {
        Duration::from_millis(rand_in_base_range(self.snapshot_interval))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn commit_nudge(&self) -> Duration {
        Duration::from_millis(self.commit_timeout)
    }

    pub fn install_snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.install_snapshot_timeout)
    }

    /// Build a config from command line style arguments; the first one is the program name.
    pub fn build(args: &[&str]) -> Result<Config, ConfigError> {
        let config = <Self as Parser>::try_parse_from(args).map_err(|e| ConfigError::InvalidArgs {
            invalid: args.join(" "),
            reason: e.to_string(),
        })?;
        config.validate()
    }

    /// Validate the state of this config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.election_timeout == 0 {
            return Err(ConfigError::ElectionTimeoutIs0);
        }

        if self.election_timeout <= self.heartbeat_interval {
            return Err(ConfigError::ElectionTimeoutLTHeartBeat {
                election_timeout: self.election_timeout,
                heartbeat_interval: self.heartbeat_interval,
            });
        }

        if self.heartbeat_interval <= self.commit_timeout {
            return Err(ConfigError::HeartBeatLTCommitTimeout {
                heartbeat_interval: self.heartbeat_interval,
                commit_timeout: self.commit_timeout,
            });
        }

        if self.max_append_entries == 0 {
            return Err(ConfigError::MaxAppendEntriesIs0);
        }

        if self.snapshot_interval == 0 {
            return Err(ConfigError::SnapshotIntervalIs0);
        }

        Ok(self)
    }
}

fn rand_in_base_range(base: u64) -> u64 {
    let upper = base.saturating_mul(2);
    if upper <= base {
        return base;
    }
    thread_rng().gen_range(base..upper)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
