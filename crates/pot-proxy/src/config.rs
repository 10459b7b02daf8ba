//! Proxy configuration.

use std::time::Duration;

/// Configuration for one broker proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Stores to serve; one backend worker is launched per store.
    pub stores: Vec<String>,
    /// External router endpoint for request/reply traffic.
    pub request_endpoint: String,
    /// External publish endpoint for broadcasts.
    pub publish_endpoint: String,
    /// Command used to launch a backend worker. The worker is invoked as
    /// `<command…> <request-endpoint> <publish-endpoint> <store>`.
    pub worker_command: Vec<String>,
    /// Fixed pause between a worker exiting and its respawn.
    pub restart_delay: Duration,
    /// Ceiling on a supervisor's wait for a worker's CONFIG response.
    pub config_timeout: Duration,
    /// Bound on socket poll calls; shutdown is observed at this cadence.
    pub poll_interval: Duration,
}

impl ProxyConfig {
    /// Creates a configuration serving the given stores, with the default
    /// external endpoints.
    pub fn new<S: Into<String>>(stores: impl IntoIterator<Item = S>) -> Self {
        Self {
            stores: stores.into_iter().map(Into::into).collect(),
            request_endpoint: "tcp://*:10111".to_string(),
            publish_endpoint: "tcp://*:10133".to_string(),
            worker_command: vec!["pot-worker".to_string()],
            restart_delay: Duration::from_secs(10),
            config_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1000),
        }
    }

    /// Sets the external request endpoint.
    pub fn with_request_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.request_endpoint = endpoint.into();
        self
    }

    /// Sets the external publish endpoint.
    pub fn with_publish_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.publish_endpoint = endpoint.into();
        self
    }

    /// Sets the backend worker command.
    pub fn with_worker_command<S: Into<String>>(
        mut self,
        command: impl IntoIterator<Item = S>,
    ) -> Self {
        self.worker_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the pause before an exited worker is respawned.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Sets the ceiling on internal CONFIG waits.
    pub fn with_config_timeout(mut self, timeout: Duration) -> Self {
        self.config_timeout = timeout;
        self
    }

    /// Sets the socket poll bound.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ProxyConfig::new(["kpfguide"])
            .with_request_endpoint("tcp://127.0.0.1:19111")
            .with_worker_command(["/opt/pot/bin/worker", "--quiet"])
            .with_restart_delay(Duration::from_secs(1));

        assert_eq!(config.stores, vec!["kpfguide".to_string()]);
        assert_eq!(config.request_endpoint, "tcp://127.0.0.1:19111");
        assert_eq!(config.worker_command.len(), 2);
        assert_eq!(config.restart_delay, Duration::from_secs(1));
        assert_eq!(config.publish_endpoint, "tcp://*:10133");
    }
}
