use std::time::Duration;
use tokio::sync::Semaphore;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Rows leased per cycle
    pub batch_size: usize,
    pub tick_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts after which a warning is logged, retries continue
    pub max_attempts: u32,
    pub publish_timeout: Duration,
    /// Concurrent publishes per batch, one means sequential
    pub workers: usize,
    /// Leases older than this are considered abandoned
    pub lease_ttl: Duration,
    pub log_enabled: bool,
    pub metrics_enabled: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            workers: DEFAULT_WORKERS,
            lease_ttl: DEFAULT_LEASE_TTL,
            log_enabled: true,
            metrics_enabled: true,
        }
    }
}

impl PublisherConfig {
    pub fn with_batch_size(
        mut self,
        batch_size: usize,
    ) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_tick_interval(
        mut self,
        tick_interval: Duration,
    ) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_backoff(
        mut self,
        initial: Duration,
        max: Duration,
    ) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_max_attempts(
        mut self,
        max_attempts: u32,
    ) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_publish_timeout(
        mut self,
        publish_timeout: Duration,
    ) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn with_workers(
        mut self,
        workers: usize,
    ) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_lease_ttl(
        mut self,
        lease_ttl: Duration,
    ) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_logs(
        mut self,
        enabled: bool,
    ) -> Self {
        self.log_enabled = enabled;
        self
    }

    pub fn with_metrics(
        mut self,
        enabled: bool,
    ) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Replaces zero values with defaults and enforces cross-field limits.
    pub fn normalized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.tick_interval.is_zero() {
            self.tick_interval = DEFAULT_TICK_INTERVAL;
        }
        if self.initial_backoff.is_zero() {
            self.initial_backoff = DEFAULT_INITIAL_BACKOFF;
        }
        if self.max_backoff.is_zero() {
            self.max_backoff = DEFAULT_MAX_BACKOFF;
        }
        self.max_backoff = self.max_backoff.max(self.initial_backoff);
        if self.max_attempts == 0 {
            self.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        if self.publish_timeout.is_zero() {
            self.publish_timeout = DEFAULT_PUBLISH_TIMEOUT;
        }
        if self.workers == 0 {
            self.workers = DEFAULT_WORKERS;
        }
        self.workers = self
            .workers
            .min(self.batch_size)
            .min(Semaphore::MAX_PERMITS);
        if self.lease_ttl.is_zero() {
            self.lease_ttl = DEFAULT_LEASE_TTL;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_fills_in_zero_values() {
        let config = PublisherConfig {
            batch_size: 0,
            tick_interval: Duration::ZERO,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_attempts: 0,
            publish_timeout: Duration::ZERO,
            workers: 0,
            lease_ttl: Duration::ZERO,
            log_enabled: false,
            metrics_enabled: false,
        }
        .normalized();

        assert_eq!(
            config,
            PublisherConfig::default()
                .with_logs(false)
                .with_metrics(false)
        );
    }

    #[test]
    fn it_caps_workers_at_the_batch_size() {
        let config = PublisherConfig::default()
            .with_batch_size(3)
            .with_workers(16)
            .normalized();
        assert_eq!(config.workers, 3);
    }

    #[test]
    fn it_keeps_max_backoff_above_initial_backoff() {
        let config = PublisherConfig::default()
            .with_backoff(Duration::from_secs(10), Duration::from_secs(1))
            .normalized();
        assert_eq!(config.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn it_caps_workers_at_the_semaphore_limit() {
        let config = PublisherConfig::default()
            .with_batch_size(usize::MAX)
            .with_workers(usize::MAX)
            .normalized();
        assert_eq!(config.batch_size, usize::MAX);
        assert_eq!(config.workers, Semaphore::MAX_PERMITS);
    }
}
