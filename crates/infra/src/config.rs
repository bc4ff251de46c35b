//! Repository backend selection.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `BATCH_REPOSITORY` | `memory` or `postgres` | `memory` |
//! | `DATABASE_URL` | Postgres connection string | required for `postgres` |
//! | `BATCH_DB_MAX_CONNECTIONS` | pool size | `10` |

use std::sync::Arc;

use thiserror::Error;

use crate::repository::{InMemoryJobRepository, JobRepository, PostgresJobRepository, RepositoryError};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown repository backend '{0}' (expected 'memory' or 'postgres')")]
    UnknownBackend(String),

    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryConfig {
    Memory,
    Postgres { url: String, max_connections: u32 },
}

impl RepositoryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = lookup("BATCH_REPOSITORY").unwrap_or_else(|| "memory".to_string());
        match backend.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(RepositoryConfig::Memory),
            "postgres" | "postgresql" => {
                let url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
                let max_connections = match lookup("BATCH_DB_MAX_CONNECTIONS") {
                    Some(raw) => match raw.trim().parse::<u32>() {
                        Ok(n) if n > 0 => n,
                        _ => {
                            return Err(ConfigError::Invalid {
                                name: "BATCH_DB_MAX_CONNECTIONS",
                                value: raw,
                            });
                        }
                    },
                    None => DEFAULT_MAX_CONNECTIONS,
                };
                Ok(RepositoryConfig::Postgres {
                    url,
                    max_connections,
                })
            }
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }

    /// Open the configured repository. Postgres connects and migrates on the
    /// current runtime.
    pub async fn connect(&self) -> Result<Arc<dyn JobRepository>, RepositoryError> {
        match self {
            RepositoryConfig::Memory => Ok(Arc::new(InMemoryJobRepository::new())),
            RepositoryConfig::Postgres {
                url,
                max_connections,
            } => {
                let repo = PostgresJobRepository::connect(url, *max_connections).await?;
                repo.migrate().await?;
                tracing::info!(max_connections, "connected postgres job repository");
                Ok(Arc::new(repo))
            }
        }
    }
}
