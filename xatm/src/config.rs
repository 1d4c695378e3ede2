//! Domain configuration types and builders.

use std::time::Duration;

use xatm_core::XaError;

use crate::pool::IsolationLevel;

/// Default domain name.
const DEFAULT_DOMAIN_NAME: &str = "default";
/// Default transaction timeout.
const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);
/// Default interval between timeout reaper sweeps.
const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(1);
/// Default upper bound for requested transaction timeouts.
const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(3600);
/// Default prune factor; pruning is disabled.
const DEFAULT_PRUNE_FACTOR: f64 = 0.0;
/// Default idle time after which a pooled connection may be pruned.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default interval between pool sweeps.
const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(30);
/// Default timeout for creating a physical connection.
const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the validation message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for XaError {
    fn from(err: ConfigError) -> Self {
        XaError::Configuration(err.message)
    }
}

// ============================================================================
// Transaction configuration
// ============================================================================

/// Timeout settings for transactions begun in a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfig {
    default_timeout: Duration,
    reaper_interval: Duration,
    max_timeout: Duration,
}

impl TransactionConfig {
    /// Returns the timeout used by `begin()`.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Returns how often the reaper looks for expired transactions.
    pub fn reaper_interval(&self) -> Duration {
        self.reaper_interval
    }

    /// Returns the largest timeout a transaction may be begun with.
    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Maps a requested timeout onto the configured bounds: zero selects the
    /// default timeout, anything above the maximum is clamped to it.
    pub fn effective_timeout(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.default_timeout
        } else {
            requested.min(self.max_timeout)
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            max_timeout: DEFAULT_MAX_TIMEOUT,
        }
    }
}

impl From<TransactionConfig> for TransactionConfigBuilder {
    fn from(config: TransactionConfig) -> Self {
        Self {
            default_timeout: Some(config.default_timeout),
            reaper_interval: Some(config.reaper_interval),
            max_timeout: Some(config.max_timeout),
        }
    }
}

/// Builder for `TransactionConfig`.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfigBuilder {
    default_timeout: Option<Duration>,
    reaper_interval: Option<Duration>,
    max_timeout: Option<Duration>,
}

impl TransactionConfigBuilder {
    /// Creates a new transaction configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default transaction timeout.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Sets the reaper sweep interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = Some(interval);
        self
    }

    /// Sets the maximum transaction timeout.
    pub fn max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = Some(timeout);
        self
    }

    /// Builds the transaction configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - any duration is zero
    /// - `default_timeout` exceeds `max_timeout`
    pub fn build(self) -> Result<TransactionConfig, ConfigError> {
        let default_timeout = self.default_timeout.unwrap_or(DEFAULT_TRANSACTION_TIMEOUT);
        let reaper_interval = self.reaper_interval.unwrap_or(DEFAULT_REAPER_INTERVAL);
        let max_timeout = self.max_timeout.unwrap_or(DEFAULT_MAX_TIMEOUT);

        if default_timeout.is_zero() {
            return Err(ConfigError::new("default_timeout must be greater than zero"));
        }
        if reaper_interval.is_zero() {
            return Err(ConfigError::new("reaper_interval must be greater than zero"));
        }
        if max_timeout.is_zero() {
            return Err(ConfigError::new("max_timeout must be greater than zero"));
        }
        if default_timeout > max_timeout {
            return Err(ConfigError::new(
                "default_timeout must not exceed max_timeout",
            ));
        }

        Ok(TransactionConfig {
            default_timeout,
            reaper_interval,
            max_timeout,
        })
    }
}

// ============================================================================
// Pool configuration
// ============================================================================

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    prune_factor: f64,
    idle_timeout: Duration,
    prune_interval: Duration,
    max_connections: usize,
    login_timeout: Duration,
    default_isolation: IsolationLevel,
}

impl PoolConfig {
    /// Returns the fraction of prunable connections evicted per sweep.
    ///
    /// `0.0` disables pruning.
    pub fn prune_factor(&self) -> f64 {
        self.prune_factor
    }

    /// Returns how long a connection must sit unused before it is prunable.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns the interval of the background sweep.
    pub fn prune_interval(&self) -> Duration {
        self.prune_interval
    }

    /// Returns the maximum number of physical connections per data source
    /// and user (0 = unbounded).
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Returns the timeout for creating a physical connection.
    pub fn login_timeout(&self) -> Duration {
        self.login_timeout
    }

    /// Returns the isolation level requested for new connections.
    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    /// Returns true if the sweep evicts anything.
    pub fn pruning_enabled(&self) -> bool {
        self.prune_factor > 0.0
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prune_factor: DEFAULT_PRUNE_FACTOR,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            max_connections: 0,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            default_isolation: IsolationLevel::default(),
        }
    }
}

impl From<PoolConfig> for PoolConfigBuilder {
    fn from(config: PoolConfig) -> Self {
        Self {
            prune_factor: Some(config.prune_factor),
            idle_timeout: Some(config.idle_timeout),
            prune_interval: Some(config.prune_interval),
            max_connections: Some(config.max_connections),
            login_timeout: Some(config.login_timeout),
            default_isolation: Some(config.default_isolation),
        }
    }
}

/// Builder for `PoolConfig`.
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    prune_factor: Option<f64>,
    idle_timeout: Option<Duration>,
    prune_interval: Option<Duration>,
    max_connections: Option<usize>,
    login_timeout: Option<Duration>,
    default_isolation: Option<IsolationLevel>,
}

impl PoolConfigBuilder {
    /// Creates a new pool configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prune factor (0.0 to 1.0).
    pub fn prune_factor(mut self, factor: f64) -> Self {
        self.prune_factor = Some(factor);
        self
    }

    /// Sets the idle time after which connections become prunable.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the interval of the background sweep.
    pub fn prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = Some(interval);
        self
    }

    /// Sets the per data source connection limit (0 = unbounded).
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Sets the connection creation timeout.
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = Some(timeout);
        self
    }

    /// Sets the isolation level requested for new connections.
    pub fn default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = Some(isolation);
        self
    }

    /// Builds the pool configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `prune_factor` is outside `0.0..=1.0`
    /// - `prune_interval` or `login_timeout` is zero
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let prune_factor = self.prune_factor.unwrap_or(DEFAULT_PRUNE_FACTOR);
        let idle_timeout = self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT);
        let prune_interval = self.prune_interval.unwrap_or(DEFAULT_PRUNE_INTERVAL);
        let max_connections = self.max_connections.unwrap_or(0);
        let login_timeout = self.login_timeout.unwrap_or(DEFAULT_LOGIN_TIMEOUT);
        let default_isolation = self.default_isolation.unwrap_or_default();

        if !(0.0..=1.0).contains(&prune_factor) {
            return Err(ConfigError::new("prune_factor must be between 0.0 and 1.0"));
        }
        if prune_interval.is_zero() {
            return Err(ConfigError::new("prune_interval must be greater than zero"));
        }
        if login_timeout.is_zero() {
            return Err(ConfigError::new("login_timeout must be greater than zero"));
        }

        Ok(PoolConfig {
            prune_factor,
            idle_timeout,
            prune_interval,
            max_connections,
            login_timeout,
            default_isolation,
        })
    }
}

// ============================================================================
// Domain configuration
// ============================================================================

/// Configuration for a [`TransactionDomain`](crate::TransactionDomain).
#[derive(Debug, Clone, PartialEq)]
pub struct DomainConfig {
    name: String,
    transaction: TransactionConfig,
    pool: PoolConfig,
}

impl DomainConfig {
    /// Creates a new domain configuration builder.
    pub fn builder() -> DomainConfigBuilder {
        DomainConfigBuilder::new()
    }

    /// Returns the domain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the transaction configuration.
    pub fn transaction(&self) -> &TransactionConfig {
        &self.transaction
    }

    /// Returns the pool configuration.
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DOMAIN_NAME.to_string(),
            transaction: TransactionConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Builder for `DomainConfig`.
#[derive(Debug, Clone, Default)]
pub struct DomainConfigBuilder {
    name: Option<String>,
    transaction: TransactionConfigBuilder,
    pool: PoolConfigBuilder,
}

impl DomainConfigBuilder {
    /// Creates a new domain configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the domain name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Configures transaction settings using a builder function.
    pub fn transaction<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TransactionConfigBuilder) -> TransactionConfigBuilder,
    {
        self.transaction = f(self.transaction);
        self
    }

    /// Configures pool settings using a builder function.
    pub fn pool<F>(mut self, f: F) -> Self
    where
        F: FnOnce(PoolConfigBuilder) -> PoolConfigBuilder,
    {
        self.pool = f(self.pool);
        self
    }

    /// Sets the default transaction timeout.
    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction = self.transaction.default_timeout(timeout);
        self
    }

    /// Sets the pool prune factor.
    pub fn prune_factor(mut self, factor: f64) -> Self {
        self.pool = self.pool.prune_factor(factor);
        self
    }

    /// Builds the domain configuration, returning an error if validation fails.
    pub fn build(self) -> Result<DomainConfig, ConfigError> {
        let name = self
            .name
            .unwrap_or_else(|| DEFAULT_DOMAIN_NAME.to_string());

        if name.is_empty() {
            return Err(ConfigError::new("name must not be empty"));
        }

        Ok(DomainConfig {
            name,
            transaction: self.transaction.build()?,
            pool: self.pool.build()?,
        })
    }
}
