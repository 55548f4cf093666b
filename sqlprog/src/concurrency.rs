//! Registry of the admission semaphores declared by configurations.
//!
//! Four independent key spaces exist: databases, load-balanced connections, physical
//! connections and programs. Reads go through an atomically swapped table and never block.
//! Writers are serialized and build a new table on every update.

use crate::{
  config::DatabasesConfig,
  sync::AdmissionSemaphore,
  topology::{normalize_connection_string, Connection, LoadBalancedConnection},
};
use arc_swap::ArcSwap;
use core::hash::Hash;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Identifies the semaphore of a logical database.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DatabaseKey {
  /// Database identifier
  pub database_id: Option<String>,
}

impl DatabaseKey {
  /// Constructor
  #[inline]
  pub fn new(database_id: Option<&str>) -> Self {
    Self { database_id: database_id.map(Into::into) }
  }
}

/// Identifies the semaphore of a load-balanced connection.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LoadBalancedConnectionKey {
  /// Load-balanced connection identifier
  pub connection_id: String,
  /// Database identifier
  pub database_id: Option<String>,
}

impl LoadBalancedConnectionKey {
  /// Constructor
  #[inline]
  pub fn new(database_id: Option<&str>, connection_id: &str) -> Self {
    Self { connection_id: connection_id.into(), database_id: database_id.map(Into::into) }
  }
}

/// Identifies the semaphore of a physical connection.
///
/// The key is the normalized connection string, therefore declarations of the same physical
/// connection share one semaphore regardless of where they are declared.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionKey {
  /// Normalized connection string
  pub normalized: String,
}

impl ConnectionKey {
  /// Normalizes `connection_string`.
  #[inline]
  pub fn new(connection_string: &str) -> Self {
    Self { normalized: normalize_connection_string(connection_string) }
  }

  /// Uses the already normalized string of `connection`.
  #[inline]
  pub fn from_connection(connection: &Connection) -> Self {
    Self { normalized: connection.normalized().into() }
  }
}

/// Identifies the semaphore of a program.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ProgramKey {
  /// Database identifier
  pub database_id: Option<String>,
  /// Lowercased program name
  pub program: String,
}

impl ProgramKey {
  /// Constructor
  #[inline]
  pub fn new(database_id: Option<&str>, program: &str) -> Self {
    Self { database_id: database_id.map(Into::into), program: program.to_lowercase() }
  }
}

/// Effective limit of a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConcurrencyLimit {
  /// Without constraints
  Unlimited,
  /// At most the given number of concurrent executions
  Limited(usize),
}

impl ConcurrencyLimit {
  /// Declared values lesser than one are unlimited.
  #[inline]
  pub fn from_declared(max_concurrency: i32) -> Self {
    match usize::try_from(max_concurrency) {
      Ok(elem) if elem > 0 => Self::Limited(elem),
      _ => Self::Unlimited,
    }
  }
}

/// Combines the limits declared by several nodes that reference the same physical connection.
///
/// Declarations are grouped into `(limit, count)` pairs that are folded from left to right. A
/// single unlimited declaration makes the whole union unlimited, otherwise limits are summed.
#[inline]
pub fn aggregate_limits(declared: &[i32]) -> ConcurrencyLimit {
  let mut groups: Vec<(i32, usize)> = Vec::new();
  for limit in declared {
    match groups.iter_mut().find(|(local, _)| local == limit) {
      Some((_, count)) => *count = count.wrapping_add(1),
      None => groups.push((*limit, 1)),
    }
  }
  let mut rslt = None;
  for (limit, count) in groups {
    rslt = match (rslt, ConcurrencyLimit::from_declared(limit)) {
      (Some(ConcurrencyLimit::Unlimited), _) | (_, ConcurrencyLimit::Unlimited) => {
        Some(ConcurrencyLimit::Unlimited)
      }
      (None, ConcurrencyLimit::Limited(local)) => {
        Some(ConcurrencyLimit::Limited(local.saturating_mul(count)))
      }
      (Some(ConcurrencyLimit::Limited(acc)), ConcurrencyLimit::Limited(local)) => {
        Some(ConcurrencyLimit::Limited(acc.saturating_add(local.saturating_mul(count))))
      }
    };
  }
  rslt.unwrap_or(ConcurrencyLimit::Unlimited)
}

#[derive(Debug, Default)]
struct Tables {
  connections: HashMap<ConnectionKey, Arc<AdmissionSemaphore>>,
  databases: HashMap<DatabaseKey, Arc<AdmissionSemaphore>>,
  load_balanced_connections: HashMap<LoadBalancedConnectionKey, Arc<AdmissionSemaphore>>,
  programs: HashMap<ProgramKey, Arc<AdmissionSemaphore>>,
}

/// Semaphores of every constrained key.
///
/// Keys that are absent impose no limit.
#[derive(Debug, Default)]
pub struct ConcurrencyRegistry {
  tables: ArcSwap<Tables>,
  update: Mutex<()>,
}

impl ConcurrencyRegistry {
  /// Empty instance
  #[inline]
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces the current limits with the limits declared by `config`.
  ///
  /// Semaphores of keys that remain constrained are resized in place so that current holders
  /// and waiters keep using them. Keys that are no longer constrained are removed and their
  /// semaphores become unbounded.
  #[inline]
  pub fn apply_config(&self, config: &DatabasesConfig) {
    let _guard = self.update.lock();
    let prev = self.tables.load_full();
    let mut next = Tables::default();
    let mut connection_limits: Vec<(ConnectionKey, Vec<(LoadBalancedConnectionKey, i32)>)> =
      Vec::new();
    for database in &config.databases {
      let database_id = database.id.as_deref();
      upsert(
        &prev.databases,
        &mut next.databases,
        DatabaseKey::new(database_id),
        ConcurrencyLimit::from_declared(database.max_concurrency),
      );
      for lb in &database.connections {
        let lb_key = LoadBalancedConnectionKey::new(database_id, &lb.id);
        upsert(
          &prev.load_balanced_connections,
          &mut next.load_balanced_connections,
          lb_key.clone(),
          ConcurrencyLimit::from_declared(lb.max_concurrency),
        );
        for connection in &lb.connections {
          let key = ConnectionKey::new(&connection.connection_string);
          let idx = match connection_limits.iter().position(|el| el.0 == key) {
            Some(elem) => elem,
            None => {
              connection_limits.push((key, Vec::new()));
              connection_limits.len().wrapping_sub(1)
            }
          };
          let Some((_, declarations)) = connection_limits.get_mut(idx) else {
            continue;
          };
          match declarations.iter_mut().find(|el| el.0 == lb_key) {
            Some(elem) => elem.1 = connection.max_concurrency,
            None => declarations.push((lb_key.clone(), connection.max_concurrency)),
          }
        }
      }
      for program in &database.programs {
        upsert(
          &prev.programs,
          &mut next.programs,
          ProgramKey::new(database_id, &program.name),
          ConcurrencyLimit::from_declared(program.max_concurrency),
        );
      }
    }
    for (key, declarations) in connection_limits {
      let limits: Vec<i32> = declarations.into_iter().map(|el| el.1).collect();
      upsert(&prev.connections, &mut next.connections, key, aggregate_limits(&limits));
    }
    retire(&prev.connections, &next.connections);
    retire(&prev.databases, &next.databases);
    retire(&prev.load_balanced_connections, &next.load_balanced_connections);
    retire(&prev.programs, &next.programs);
    _debug!(
      connections = next.connections.len(),
      databases = next.databases.len(),
      load_balanced_connections = next.load_balanced_connections.len(),
      programs = next.programs.len(),
      "Concurrency configuration applied"
    );
    self.tables.store(Arc::new(next));
  }

  /// Semaphores of an execution in the order that every caller must follow: connection,
  /// load-balanced connection, database and program.
  #[inline]
  pub fn execution_chain(
    &self,
    lb: &LoadBalancedConnection,
    connection: &Connection,
    program: &str,
  ) -> [Option<Arc<AdmissionSemaphore>>; 4] {
    let tables = self.tables.load();
    let database_id = lb.database_id();
    [
      tables.connections.get(&ConnectionKey::from_connection(connection)).cloned(),
      tables
        .load_balanced_connections
        .get(&LoadBalancedConnectionKey::new(database_id, lb.id()))
        .cloned(),
      tables.databases.get(&DatabaseKey::new(database_id)).cloned(),
      tables.programs.get(&ProgramKey::new(database_id, program)).cloned(),
    ]
  }

  /// Semaphore of a physical connection.
  #[inline]
  pub fn connection_semaphore(&self, key: &ConnectionKey) -> Option<Arc<AdmissionSemaphore>> {
    self.tables.load().connections.get(key).cloned()
  }

  /// Semaphore of a logical database.
  #[inline]
  pub fn database_semaphore(&self, key: &DatabaseKey) -> Option<Arc<AdmissionSemaphore>> {
    self.tables.load().databases.get(key).cloned()
  }

  /// Semaphore of a load-balanced connection.
  #[inline]
  pub fn load_balanced_connection_semaphore(
    &self,
    key: &LoadBalancedConnectionKey,
  ) -> Option<Arc<AdmissionSemaphore>> {
    self.tables.load().load_balanced_connections.get(key).cloned()
  }

  /// Semaphore of a program.
  #[inline]
  pub fn program_semaphore(&self, key: &ProgramKey) -> Option<Arc<AdmissionSemaphore>> {
    self.tables.load().programs.get(key).cloned()
  }
}

fn retire<K>(prev: &HashMap<K, Arc<AdmissionSemaphore>>, next: &HashMap<K, Arc<AdmissionSemaphore>>)
where
  K: Eq + Hash,
{
  for (key, semaphore) in prev {
    if !next.contains_key(key) {
      semaphore.set_max_count(AdmissionSemaphore::UNBOUNDED);
    }
  }
}

fn upsert<K>(
  prev: &HashMap<K, Arc<AdmissionSemaphore>>,
  next: &mut HashMap<K, Arc<AdmissionSemaphore>>,
  key: K,
  limit: ConcurrencyLimit,
) where
  K: Eq + Hash,
{
  let ConcurrencyLimit::Limited(max) = limit else {
    let _prev = next.remove(&key);
    return;
  };
  let semaphore = match prev.get(&key) {
    Some(elem) => {
      elem.set_max_count(max);
      Arc::clone(elem)
    }
    None => Arc::new(AdmissionSemaphore::new(max)),
  };
  let _prev = next.insert(key, semaphore);
}
