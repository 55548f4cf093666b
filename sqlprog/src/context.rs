use crate::{
  concurrency::{ConcurrencyRegistry, LoadBalancedConnectionKey},
  config::{DatabasesConfig, ExecutorConfig},
  driver::Driver,
  executor::ExecutionError,
  program::{Program, ProgramOptions, ProgramParameter},
  rng::{choose_weighted, std_seed, Xorshift64},
  topology::LoadBalancedConnection,
};
use arc_swap::ArcSwap;
use core::fmt::{Debug, Formatter};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Everything executions share: the driver, the concurrency limits, the current topology and
/// the random source of load balancers.
///
/// Independent instances don't share anything, which allows several isolated configurations
/// in the same process.
pub struct DbContext<D> {
  config: ExecutorConfig,
  driver: D,
  registry: ConcurrencyRegistry,
  rng: Mutex<Xorshift64>,
  topology: ArcSwap<HashMap<LoadBalancedConnectionKey, Arc<LoadBalancedConnection>>>,
  update: Mutex<()>,
}

impl<D> DbContext<D>
where
  D: Driver,
{
  /// Creates an instance without databases seeded by [`std_seed`].
  #[inline]
  pub fn new(driver: D, config: ExecutorConfig) -> Self {
    Self::with_seed(driver, config, std_seed())
  }

  /// Creates an instance without databases whose load balancers are seeded by `seed`.
  #[inline]
  pub fn with_seed(driver: D, config: ExecutorConfig, seed: u64) -> Self {
    Self {
      config,
      driver,
      registry: ConcurrencyRegistry::new(),
      rng: Mutex::new(Xorshift64::new(seed)),
      topology: ArcSwap::from_pointee(HashMap::new()),
      update: Mutex::new(()),
    }
  }

  /// Replaces concurrency limits and load-balanced connections.
  ///
  /// Programs created before the call keep using the load-balanced connections they were
  /// created with while limits are immediately updated for everyone.
  #[inline]
  pub fn apply_config(&self, config: &DatabasesConfig) {
    let _guard = self.update.lock();
    self.registry.apply_config(config);
    let mut topology = HashMap::new();
    for database in &config.databases {
      for lb in &database.connections {
        let key = LoadBalancedConnectionKey::new(database.id.as_deref(), &lb.id);
        let value = Arc::new(LoadBalancedConnection::from_config(database, lb));
        let _prev = topology.insert(key, value);
      }
    }
    self.topology.store(Arc::new(topology));
  }

  /// Runtime parameters
  #[inline]
  pub fn config(&self) -> &ExecutorConfig {
    &self.config
  }

  /// Driver
  #[inline]
  pub fn driver(&self) -> &D {
    &self.driver
  }

  /// Current declaration of a load-balanced connection.
  #[inline]
  pub fn load_balanced_connection(
    &self,
    database_id: Option<&str>,
    connection_id: &str,
  ) -> crate::Result<Arc<LoadBalancedConnection>> {
    let key = LoadBalancedConnectionKey::new(database_id, connection_id);
    match self.topology.load().get(&key) {
      Some(elem) => Ok(Arc::clone(elem)),
      None => Err(
        ExecutionError::UnknownLoadBalancedConnection {
          connection_id: key.connection_id,
          database_id: key.database_id,
        }
        .into(),
      ),
    }
  }

  /// Creates a program attached to the current declaration of a load-balanced connection.
  ///
  /// Mappings are validated lazily, on the first execution.
  #[inline]
  pub fn program(
    self: &Arc<Self>,
    database_id: Option<&str>,
    connection_id: &str,
    name: &str,
    parameters: Vec<ProgramParameter>,
    options: ProgramOptions,
  ) -> crate::Result<Arc<Program<D>>> {
    let connection = self.load_balanced_connection(database_id, connection_id)?;
    Ok(Arc::new(Program::new(Arc::clone(self), connection, name, parameters, options)))
  }

  /// Concurrency limits
  #[inline]
  pub fn registry(&self) -> &ConcurrencyRegistry {
    &self.registry
  }

  pub(crate) fn pick<'items, T>(
    &self,
    items: &'items [T],
    weight: impl Fn(&T) -> f64,
  ) -> Option<&'items T> {
    choose_weighted(items, weight, &mut *self.rng.lock())
  }
}

impl<D> Debug for DbContext<D> {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("DbContext")
      .field("config", &self.config)
      .field("registry", &self.registry)
      .field("topology", &self.topology.load().len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    concurrency::ConnectionKey,
    driver::memory::MemoryDriver,
    executor::ExecutionError,
    tests::{context, databases, program, DATABASE, LB, PRIMARY, REPLICA},
    Error,
  };

  #[test]
  fn unknown_load_balanced_connections_are_reported() {
    let ctx = context(&MemoryDriver::new(), &databases(&[(PRIMARY, 1.0, 0)]));
    assert!(ctx.load_balanced_connection(Some(DATABASE), LB).is_ok());
    assert!(matches!(
      ctx.load_balanced_connection(None, LB),
      Err(Error::ExecutionError(ExecutionError::UnknownLoadBalancedConnection {
        database_id: None,
        ..
      }))
    ));
  }

  #[test]
  fn existing_programs_keep_their_topology_while_limits_change() {
    let ctx = context(&MemoryDriver::new(), &databases(&[(PRIMARY, 1.0, 1)]));
    let program = program(&ctx, "spDouble", &[]);
    ctx.apply_config(&databases(&[(PRIMARY, 1.0, 3), (REPLICA, 1.0, 0)]));
    assert_eq!(program.connection().connections().len(), 1);
    let current = ctx.load_balanced_connection(Some(DATABASE), LB).unwrap();
    assert_eq!(current.connections().len(), 2);
    let semaphore = ctx.registry().connection_semaphore(&ConnectionKey::new(PRIMARY)).unwrap();
    assert_eq!(semaphore.max_count(), 3);
  }
}
