//! Load-balanced sets of physical connections.

use crate::config::{DatabaseConfig, LoadBalancedConnectionConfig};
use std::{collections::BTreeMap, sync::Arc};

/// Descriptor of a physical connection.
#[derive(Debug, PartialEq)]
pub struct Connection {
  max_concurrency: i32,
  normalized: String,
  raw: String,
  weight: f64,
}

impl Connection {
  /// Constructor
  #[inline]
  pub fn new(raw: &str, weight: f64, max_concurrency: i32) -> Self {
    Self { max_concurrency, normalized: normalize_connection_string(raw), raw: raw.into(), weight }
  }

  /// If this connection can be selected by load balancers.
  #[inline]
  pub fn is_selectable(&self) -> bool {
    self.weight.is_finite() && self.weight > 0.0
  }

  /// Declared limit. Values lesser than one mean unconstrained.
  #[inline]
  pub fn max_concurrency(&self) -> i32 {
    self.max_concurrency
  }

  /// Canonical connection string that identifies the physical connection.
  #[inline]
  pub fn normalized(&self) -> &str {
    &self.normalized
  }

  /// Connection string as declared.
  #[inline]
  pub fn raw(&self) -> &str {
    &self.raw
  }

  /// Relative selection weight
  #[inline]
  pub fn weight(&self) -> f64 {
    self.weight
  }
}

/// Ordered set of physical connections that reach the same logical database.
///
/// Instances are never modified. Configuration changes create new instances.
#[derive(Debug, PartialEq)]
pub struct LoadBalancedConnection {
  connections: Vec<Arc<Connection>>,
  database_id: Option<String>,
  id: String,
}

impl LoadBalancedConnection {
  /// Constructor
  #[inline]
  pub fn new(database_id: Option<&str>, id: &str, connections: Vec<Arc<Connection>>) -> Self {
    Self { connections, database_id: database_id.map(Into::into), id: id.into() }
  }

  /// Builds an instance based on a configuration node.
  #[inline]
  pub fn from_config(database: &DatabaseConfig, config: &LoadBalancedConnectionConfig) -> Self {
    let connections = config
      .connections
      .iter()
      .map(|el| Arc::new(Connection::new(&el.connection_string, el.weight, el.max_concurrency)))
      .collect();
    Self::new(database.id.as_deref(), &config.id, connections)
  }

  /// Physical connections
  #[inline]
  pub fn connections(&self) -> &[Arc<Connection>] {
    &self.connections
  }

  /// Identifier of the logical database.
  #[inline]
  pub fn database_id(&self) -> Option<&str> {
    self.database_id.as_deref()
  }

  /// Identifier, unique within the database.
  #[inline]
  pub fn id(&self) -> &str {
    &self.id
  }
}

/// Canonical form of a `key=value;` connection string.
///
/// Keys are case-insensitive and common synonyms are folded into a single name. Values can
/// be surrounded by single or double quotes, where a doubled quote represents itself. Pairs
/// are sorted by key and, in case of duplicates, the last one wins.
///
/// ```rust
/// use sqlprog::topology::normalize_connection_string;
/// assert_eq!(
///   normalize_connection_string("Server=db1; Database=app;Trusted_Connection=yes"),
///   normalize_connection_string("initial catalog=app; data source=db1; Integrated Security=true")
/// );
/// ```
#[inline]
pub fn normalize_connection_string(raw: &str) -> String {
  let mut pairs = BTreeMap::new();
  for (key, value) in parse_pairs(raw) {
    let key = canonical_key(&key);
    if key.is_empty() {
      continue;
    }
    let value = canonical_value(value);
    let _prev = pairs.insert(key, value);
  }
  let mut rslt = String::with_capacity(raw.len());
  for (key, value) in pairs {
    if !rslt.is_empty() {
      rslt.push(';');
    }
    rslt.push_str(&key);
    rslt.push('=');
    if value.contains([';', '=', '"', '\'']) || value.starts_with(' ') || value.ends_with(' ') {
      rslt.push('"');
      rslt.push_str(&value.replace('"', "\"\""));
      rslt.push('"');
    } else {
      rslt.push_str(&value);
    }
  }
  rslt
}

const SYNONYMS: &[(&str, &str)] = &[
  ("addr", "data source"),
  ("address", "data source"),
  ("database", "initial catalog"),
  ("network address", "data source"),
  ("pwd", "password"),
  ("server", "data source"),
  ("trusted_connection", "integrated security"),
  ("uid", "user id"),
  ("user", "user id"),
];

fn canonical_key(key: &str) -> String {
  let lower = key.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
  match SYNONYMS.iter().find(|(synonym, _)| *synonym == lower) {
    Some((_, canonical)) => (*canonical).into(),
    None => lower,
  }
}

fn canonical_value(value: String) -> String {
  match value.to_lowercase().as_str() {
    "true" | "yes" | "sspi" => "true".into(),
    "false" | "no" => "false".into(),
    _ => value,
  }
}

fn parse_pairs(raw: &str) -> Vec<(String, String)> {
  let mut rslt = Vec::new();
  let mut chars = raw.chars().peekable();
  loop {
    let mut key = String::new();
    while let Some(ch) = chars.next_if(|el| *el != '=' && *el != ';') {
      key.push(ch);
    }
    match chars.next() {
      None => break,
      Some(';') => continue,
      Some(_) => {}
    }
    while chars.next_if(|el| el.is_whitespace()).is_some() {}
    let mut value = String::new();
    match chars.peek().copied() {
      Some(quote @ ('"' | '\'')) => {
        let _ = chars.next();
        while let Some(ch) = chars.next() {
          if ch == quote && chars.next_if_eq(&quote).is_none() {
            break;
          }
          value.push(ch);
        }
        while chars.next_if(|el| *el != ';').is_some() {}
      }
      _ => {
        while let Some(ch) = chars.next_if(|el| *el != ';') {
          value.push(ch);
        }
        let trimmed = value.trim_end().len();
        value.truncate(trimmed);
      }
    }
    let _ = chars.next();
    rslt.push((key, value));
  }
  rslt
}

#[cfg(test)]
mod tests {
  use crate::topology::normalize_connection_string;

  #[test]
  fn equivalent_strings_collapse() {
    let lhs = normalize_connection_string("Server=db1;Database=app;UID=sa;PWD=x;");
    let rhs =
      normalize_connection_string(" password = x ; user id=sa;data source=db1;initial catalog=app");
    assert_eq!(lhs, rhs);
    assert_eq!(lhs, "data source=db1;initial catalog=app;password=x;user id=sa");
  }

  #[test]
  fn quoted_values_are_preserved() {
    assert_eq!(
      normalize_connection_string("Password='a;b''c';Server=db"),
      "data source=db;password=\"a;b'c\""
    );
    assert_eq!(
      normalize_connection_string("password=\"a;b'c\";data source=db"),
      normalize_connection_string("Password='a;b''c';Server=db"),
    );
  }

  #[test]
  fn last_duplicate_wins_and_empty_pairs_are_dropped() {
    assert_eq!(normalize_connection_string(";;Server=a;;server=b;"), "data source=b");
    assert_eq!(normalize_connection_string(""), "");
  }

  #[test]
  fn booleans_are_canonical() {
    assert_eq!(
      normalize_connection_string("Trusted_Connection=Yes"),
      normalize_connection_string("Integrated Security=SSPI")
    );
    assert_ne!(normalize_connection_string("Server=A"), normalize_connection_string("Server=B"));
  }
}
