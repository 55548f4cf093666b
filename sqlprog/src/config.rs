//! Declarative description of databases, connections and programs.
//!
//! Trees are usually deserialized from files (`serde` feature) and pushed through
//! [`crate::DbContext::apply_config`]. Every node has an optional `max_concurrency` where
//! values lesser than one mean unconstrained.

use core::time::Duration;

/// Root of the configuration tree.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatabasesConfig {
  /// Databases
  pub databases: Vec<DatabaseConfig>,
}

impl DatabasesConfig {
  /// Empty instance
  #[inline]
  pub const fn new() -> Self {
    Self { databases: Vec::new() }
  }

  /// Adds a database.
  #[inline]
  #[must_use]
  pub fn database(mut self, database: DatabaseConfig) -> Self {
    self.databases.push(database);
    self
  }
}

/// A logical database and everything that can reach it.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatabaseConfig {
  /// Load-balanced connections
  pub connections: Vec<LoadBalancedConnectionConfig>,
  /// Identifier. Connections without a database identity use `None`.
  pub id: Option<String>,
  /// Maximum number of concurrent executions against the database.
  pub max_concurrency: i32,
  /// Programs with specific limits.
  pub programs: Vec<ProgramConfig>,
}

impl DatabaseConfig {
  /// Instance without limits.
  #[inline]
  pub fn new(id: Option<&str>) -> Self {
    Self {
      connections: Vec::new(),
      id: id.map(Into::into),
      max_concurrency: 0,
      programs: Vec::new(),
    }
  }

  /// Adds a load-balanced connection.
  #[inline]
  #[must_use]
  pub fn connection(mut self, connection: LoadBalancedConnectionConfig) -> Self {
    self.connections.push(connection);
    self
  }

  /// Changes the limit.
  #[inline]
  #[must_use]
  pub fn max_concurrency(mut self, max_concurrency: i32) -> Self {
    self.max_concurrency = max_concurrency;
    self
  }

  /// Adds a program.
  #[inline]
  #[must_use]
  pub fn program(mut self, program: ProgramConfig) -> Self {
    self.programs.push(program);
    self
  }
}

/// Set of interchangeable physical connections.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancedConnectionConfig {
  /// Physical connections
  pub connections: Vec<ConnectionConfig>,
  /// Identifier, unique within the database.
  pub id: String,
  /// Maximum number of concurrent executions against the whole set.
  pub max_concurrency: i32,
}

impl LoadBalancedConnectionConfig {
  /// Instance without limits.
  #[inline]
  pub fn new(id: &str) -> Self {
    Self { connections: Vec::new(), id: id.into(), max_concurrency: 0 }
  }

  /// Adds a physical connection.
  #[inline]
  #[must_use]
  pub fn connection(mut self, connection: ConnectionConfig) -> Self {
    self.connections.push(connection);
    self
  }

  /// Changes the limit.
  #[inline]
  #[must_use]
  pub fn max_concurrency(mut self, max_concurrency: i32) -> Self {
    self.max_concurrency = max_concurrency;
    self
  }
}

/// Physical connection
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
  /// Driver-specific string of `key=value` pairs.
  pub connection_string: String,
  /// Maximum number of concurrent executions against the connection.
  pub max_concurrency: i32,
  /// Relative selection weight. Non-positive values exclude the connection from the load
  /// balancing.
  pub weight: f64,
}

impl ConnectionConfig {
  /// Instance with weight `1` and without limits.
  #[inline]
  pub fn new(connection_string: &str) -> Self {
    Self { connection_string: connection_string.into(), max_concurrency: 0, weight: 1.0 }
  }

  /// Changes the limit.
  #[inline]
  #[must_use]
  pub fn max_concurrency(mut self, max_concurrency: i32) -> Self {
    self.max_concurrency = max_concurrency;
    self
  }

  /// Changes the weight.
  #[inline]
  #[must_use]
  pub fn weight(mut self, weight: f64) -> Self {
    self.weight = weight;
    self
  }
}

impl Default for ConnectionConfig {
  #[inline]
  fn default() -> Self {
    Self::new("")
  }
}

/// Limits of a specific program.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgramConfig {
  /// Maximum number of concurrent executions of the program.
  pub max_concurrency: i32,
  /// Case-insensitive name
  pub name: String,
}

impl ProgramConfig {
  /// Constructor
  #[inline]
  pub fn new(name: &str, max_concurrency: i32) -> Self {
    Self { max_concurrency, name: name.into() }
  }
}

/// Runtime parameters of executions.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExecutorConfig {
  /// Grace period added to command timeouts before resources are forcefully torn down.
  pub additional_cancellation_time: Duration,
  /// Timeout of programs that don't specify one. Zero waits forever.
  pub default_program_timeout: Duration,
}

impl Default for ExecutorConfig {
  #[inline]
  fn default() -> Self {
    Self {
      additional_cancellation_time: Duration::from_secs(1),
      default_program_timeout: Duration::from_secs(30),
    }
  }
}

#[cfg(all(feature = "serde", test))]
mod tests {
  use crate::config::{ConnectionConfig, DatabasesConfig};

  #[test]
  fn deserializes_with_defaults() {
    let json = r#"{
      "databases": [{
        "id": "main",
        "max_concurrency": 4,
        "connections": [{
          "id": "primary",
          "connections": [
            { "connection_string": "Server=a;Database=b" },
            { "connection_string": "Server=c;Database=b", "weight": 0.5, "max_concurrency": 2 }
          ]
        }],
        "programs": [{ "name": "spGetUser", "max_concurrency": 1 }]
      }]
    }"#;
    let config: DatabasesConfig = serde_json::from_str(json).unwrap();
    let database = &config.databases[0];
    assert_eq!(database.id.as_deref(), Some("main"));
    assert_eq!(database.connections[0].max_concurrency, 0);
    assert_eq!(
      database.connections[0].connections[0],
      ConnectionConfig::new("Server=a;Database=b")
    );
    assert_eq!(database.connections[0].connections[1].weight, 0.5);
    assert_eq!(database.programs[0].max_concurrency, 1);
  }
}
