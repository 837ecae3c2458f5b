use std::{borrow::Cow, fmt, time::Duration};
use tokio::time::Instant;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TX_NAME: &str = "fx_outbox.tx";
/// Stand-in for timeouts too large to add to an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
/// PostgreSQL stores `lock_timeout` as a 32 bit millisecond count
const MAX_LOCK_TIMEOUT_MS: u128 = i32::MAX as u128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    fn as_sql(self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "READ WRITE",
            AccessMode::ReadOnly => "READ ONLY",
        }
    }
}

/// Per-call overrides, merged onto the manager's [`TxConfig`].
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub access_mode: Option<AccessMode>,
    pub timeout: Option<Duration>,
    pub lock_timeout: Option<Duration>,
    /// A deadline inherited from the caller, kept when earlier than the timeout
    pub deadline: Option<Instant>,
    pub name: Option<Cow<'static, str>>,
}

impl TxOptions {
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_isolation(
        mut self,
        isolation: IsolationLevel,
    ) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_access_mode(
        mut self,
        access_mode: AccessMode,
    ) -> Self {
        self.access_mode = Some(access_mode);
        self
    }

    pub fn with_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_lock_timeout(
        mut self,
        lock_timeout: Duration,
    ) -> Self {
        self.lock_timeout = Some(lock_timeout);
        self
    }

    pub fn with_deadline(
        mut self,
        deadline: Instant,
    ) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Invalid schema name '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
pub struct InvalidSchema(pub String);

/// Defaults for every transaction opened by a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxConfig {
    /// Applied with `SET LOCAL search_path` when set
    pub schema: Option<String>,
    pub isolation: IsolationLevel,
    pub timeout: Duration,
    pub lock_timeout: Option<Duration>,
    /// Attempts after the first one in `within_tx_retrying`
    pub max_retries: u32,
    pub metrics_enabled: bool,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            schema: None,
            isolation: IsolationLevel::default(),
            timeout: DEFAULT_TIMEOUT,
            lock_timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
            metrics_enabled: true,
        }
    }
}

impl TxConfig {
    pub fn with_schema(
        mut self,
        schema: impl Into<String>,
    ) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_isolation(
        mut self,
        isolation: IsolationLevel,
    ) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_lock_timeout(
        mut self,
        lock_timeout: Duration,
    ) -> Self {
        self.lock_timeout = Some(lock_timeout);
        self
    }

    pub fn with_max_retries(
        mut self,
        max_retries: u32,
    ) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metrics(
        mut self,
        enabled: bool,
    ) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    /// Applies defaults to unset values and validates the schema name.
    pub fn normalized(mut self) -> Result<Self, InvalidSchema> {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.lock_timeout.is_some_and(|timeout| timeout.is_zero()) {
            self.lock_timeout = None;
        }
        self.schema = match self.schema.take() {
            Some(schema) if schema.trim().is_empty() => None,
            Some(schema) => Some(validate_identifier(schema.trim())?),
            None => None,
        };
        Ok(self)
    }

    /// Merges per-call options onto this preset.
    pub(crate) fn resolve(
        &self,
        options: TxOptions,
        now: Instant,
    ) -> TxSettings {
        let timeout = options
            .timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(self.timeout);
        let bounded = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let deadline = match options.deadline {
            Some(deadline) if deadline < bounded => deadline,
            _ => bounded,
        };

        TxSettings {
            name: options
                .name
                .unwrap_or(Cow::Borrowed(DEFAULT_TX_NAME)),
            isolation: options.isolation.unwrap_or(self.isolation),
            access_mode: options.access_mode.unwrap_or_default(),
            lock_timeout: options
                .lock_timeout
                .or(self.lock_timeout)
                .filter(|timeout| !timeout.is_zero()),
            schema: self.schema.clone(),
            deadline,
        }
    }
}

/// Validates a PostgreSQL identifier for use in generated statements.
pub(crate) fn validate_identifier(name: &str) -> Result<String, InvalidSchema> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && name.len() <= 63 {
        Ok(name.to_owned())
    } else {
        Err(InvalidSchema(name.to_owned()))
    }
}

/// Fully resolved settings for one transaction.
#[derive(Debug, Clone)]
pub(crate) struct TxSettings {
    pub name: Cow<'static, str>,
    pub isolation: IsolationLevel,
    pub access_mode: AccessMode,
    pub lock_timeout: Option<Duration>,
    pub schema: Option<String>,
    pub deadline: Instant,
}

impl TxSettings {
    pub fn read_only(&self) -> bool {
        self.access_mode == AccessMode::ReadOnly
    }

    /// Statements run right after `BEGIN`, in one round trip.
    pub fn preamble(&self) -> String {
        let mut sql = format!(
            "SET TRANSACTION ISOLATION LEVEL {}, {};",
            self.isolation.as_sql(),
            self.access_mode.as_sql()
        );
        if let Some(schema) = &self.schema {
            sql.push_str(&format!(" SET LOCAL search_path TO \"{schema}\";"));
        }
        if let Some(lock_timeout) = self.lock_timeout {
            let millis =
                lock_timeout.as_millis().clamp(1, MAX_LOCK_TIMEOUT_MS);
            sql.push_str(&format!(" SET LOCAL lock_timeout = '{millis}ms';"));
        }
        sql
    }
}
