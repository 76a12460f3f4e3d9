use std::time::Duration;

/// Host-key verification policy for outbound SSH connections.
///
/// `AcceptAny` is only safe when the broker itself provisioned the target
/// (local container sessions); deployments that accept user-supplied hosts
/// should run `Strict`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostVerification {
    AcceptAny,
    Strict,
}

/// Every timing and rate-limit policy the broker and supervisor apply.
/// One record, passed in at construction.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Minimum gap between `connect` attempts on one channel.
    pub min_connect_interval: Duration,
    /// Wall-clock budget for an SSH connection to become ready.
    pub connect_timeout: Duration,
    /// Sessions and containers idle longer than this are reaped.
    pub idle_timeout: Duration,
    pub health_sweep_interval: Duration,
    pub session_sweep_interval: Duration,
    pub container_sweep_interval: Duration,
    /// A session stuck in `Connecting` longer than this is failed by the
    /// health sweep even if its own timer was lost.
    pub stuck_connecting_timeout: Duration,
    /// Grace between `terminal:container-created` and the automatic
    /// connect, letting sshd finish its first-boot key generation.
    pub container_ready_grace: Duration,
    pub ssh_keepalive: Duration,
    pub ssh_keepalive_max_miss: usize,
    pub host_verification: HostVerification,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            min_connect_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
            health_sweep_interval: Duration::from_secs(60),
            session_sweep_interval: Duration::from_secs(5 * 60),
            container_sweep_interval: Duration::from_secs(10 * 60),
            stuck_connecting_timeout: Duration::from_secs(60),
            container_ready_grace: Duration::from_secs(2),
            ssh_keepalive: Duration::from_secs(30),
            ssh_keepalive_max_miss: 3,
            host_verification: HostVerification::AcceptAny,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let config = BrokerConfig::default();
        assert_eq!(config.min_connect_interval, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.health_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.session_sweep_interval, Duration::from_secs(300));
        assert_eq!(config.container_sweep_interval, Duration::from_secs(600));
        assert_eq!(config.stuck_connecting_timeout, Duration::from_secs(60));
        assert_eq!(config.container_ready_grace, Duration::from_secs(2));
        assert_eq!(config.ssh_keepalive, Duration::from_secs(30));
        assert_eq!(config.ssh_keepalive_max_miss, 3);
    }
}
