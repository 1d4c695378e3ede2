//! The seam between the pool and the driver that opens physical connections.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use xatm_core::Result;

use crate::config::ConfigError;
use crate::resource::XaResource;

/// Transaction isolation level requested for new physical connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// Dirty reads permitted.
    ReadUncommitted,
    /// Only committed data is read.
    #[default]
    ReadCommitted,
    /// Rows read stay stable for the duration of the transaction.
    RepeatableRead,
    /// Full serializability.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadUncommitted => "read-uncommitted",
            Self::ReadCommitted => "read-committed",
            Self::RepeatableRead => "repeatable-read",
            Self::Serializable => "serializable",
        };
        f.write_str(name)
    }
}

impl FromStr for IsolationLevel {
    type Err = ConfigError;

    /// Accepts kebab-case, snake_case or upper-case names, e.g.
    /// `read-committed`, `read_committed` or `READ_COMMITTED`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "read-uncommitted" => Ok(Self::ReadUncommitted),
            "read-committed" => Ok(Self::ReadCommitted),
            "repeatable-read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            other => Err(ConfigError::new(format!(
                "unknown isolation level '{}'",
                other
            ))),
        }
    }
}

/// User credentials presented when opening a physical connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    /// Creates credentials for `user`.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Returns the user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a factory needs to open one physical connection.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    data_source: String,
    credentials: Option<Credentials>,
    isolation: IsolationLevel,
}

impl ConnectionRequest {
    pub(crate) fn new(
        data_source: impl Into<String>,
        credentials: Option<Credentials>,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            credentials,
            isolation,
        }
    }

    /// Returns the logical data source name.
    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// Returns the credentials, if any were supplied.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Returns the isolation level to configure on the connection.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

/// An open connection to a resource manager.
///
/// The pool never closes a physical connection on behalf of a handle; it
/// calls [`close`](Self::close) only when the connection is evicted.
#[async_trait]
pub trait PhysicalConnection: Send + Sync + fmt::Debug {
    /// Returns the transactional resource of this connection.
    ///
    /// Must return the same instance on every call: enlistment identifies
    /// resources by instance.
    fn xa_resource(&self) -> Arc<dyn XaResource>;

    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// Opens physical connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Opens a new physical connection.
    async fn create(&self, request: &ConnectionRequest) -> Result<Arc<dyn PhysicalConnection>>;
}
