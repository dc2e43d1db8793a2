//! Configuration for the scheduler

use std::time::Duration;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_MAX_BUILD_POLLS: u32 = 60;
/// Attempts a pod gets before it is marked failed.
pub const ERROR_RESCHEDULE_TIMES_LIMIT: u32 = 3;
const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// How the scheduler paces and bounds its work.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Cloud hosts the default algorithm picks from, as `address[:port]` or full URLs
    pub hosts: Vec<String>,
    /// Pause between two status polls of a building server
    pub poll_interval: Duration,
    /// Polls after which a server still building is given up on
    pub max_build_polls: u32,
    /// Attempts a pod gets before it is marked failed
    pub reschedule_limit: u32,
    /// Capacity of the queue between scheduling and the per-pod server tasks
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            hosts: Vec::new(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_build_polls: DEFAULT_MAX_BUILD_POLLS,
            reschedule_limit: ERROR_RESCHEDULE_TIMES_LIMIT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// The default configuration scheduling onto the given hosts.
    pub fn with_hosts(hosts: Vec<String>) -> Self {
        SchedulerConfig {
            hosts,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::with_hosts(vec!["10.0.0.1".to_owned()]);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_build_polls, 60);
        assert_eq!(config.reschedule_limit, 3);
        assert_eq!(config.queue_capacity, 1);
    }
}
