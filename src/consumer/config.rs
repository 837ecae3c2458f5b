use tokio::sync::Semaphore;

const DEFAULT_SOURCE_SERVICE: &str = "unknown";
const DEFAULT_MAX_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Recorded on every inbox row
    pub source_service: String,
    /// Deliveries handled at the same time
    pub max_concurrency: usize,
    pub log_enabled: bool,
    pub metrics_enabled: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            source_service: DEFAULT_SOURCE_SERVICE.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            log_enabled: true,
            metrics_enabled: true,
        }
    }
}

impl ConsumerConfig {
    pub fn with_source_service(
        mut self,
        source_service: impl Into<String>,
    ) -> Self {
        self.source_service = source_service.into();
        self
    }

    pub fn with_max_concurrency(
        mut self,
        max_concurrency: usize,
    ) -> Self {
        self.max_concurrency = max_concurrency;
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

    pub fn normalized(mut self) -> Self {
        let trimmed = self.source_service.trim();
        self.source_service = if trimmed.is_empty() {
            DEFAULT_SOURCE_SERVICE.to_string()
        } else {
            trimmed.to_string()
        };
        self.max_concurrency = match self.max_concurrency {
            0 => DEFAULT_MAX_CONCURRENCY,
            n => n.min(Semaphore::MAX_PERMITS),
        };
        self
    }
}
