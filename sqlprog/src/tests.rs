//! Fixtures shared by the tests of several modules.

use crate::{
  config::{
    ConnectionConfig, DatabaseConfig, DatabasesConfig, ExecutorConfig, LoadBalancedConnectionConfig,
  },
  driver::memory::{MemoryDriver, MemoryResultSet},
  program::{Program, ProgramOptions, ProgramParameter},
  schema::{ParameterDefinition, ProgramDefinition},
  value::{SqlType, SqlValue},
  DbContext,
};
use std::sync::Arc;

pub(crate) const DATABASE: &str = "app";
pub(crate) const LB: &str = "main";
pub(crate) const PRIMARY: &str = "Server=primary;Database=app";
pub(crate) const REPLICA: &str = "Server=replica;Database=app";

/// `spDouble(@Value int, @Result int output)` writes `@Value * 2` into `@Result` and returns
/// `@Value` as a scalar.
pub(crate) fn register_double(driver: &MemoryDriver) {
  driver.register(
    ProgramDefinition::new(
      "spDouble",
      vec![
        ParameterDefinition::input("@Value", SqlType::Int),
        ParameterDefinition::output("@Result", SqlType::Int),
      ],
    ),
    |call| {
      let value = match call.get("@value") {
        Some(SqlValue::I32(elem)) => *elem,
        _ => 0,
      };
      let _ = call.set("@result", value * 2);
      let mut rslt = MemoryResultSet::scalar(value);
      rslt.records_affected = 1;
      Ok(rslt)
    },
  );
}

/// `spHost()` returns the connection that received the call.
pub(crate) fn register_host(driver: &MemoryDriver) {
  driver.register(ProgramDefinition::new("spHost", Vec::new()), |call| {
    Ok(MemoryResultSet::scalar(call.connection().to_owned()))
  });
}

/// One database with one load-balanced connection made of `connections`, which are tuples of
/// connection strings, weights and limits.
pub(crate) fn databases(connections: &[(&str, f64, i32)]) -> DatabasesConfig {
  let mut lb = LoadBalancedConnectionConfig::new(LB);
  for (connection_string, weight, max_concurrency) in connections {
    lb = lb.connection(
      ConnectionConfig::new(connection_string).weight(*weight).max_concurrency(*max_concurrency),
    );
  }
  DatabasesConfig::default().database(DatabaseConfig::new(Some(DATABASE)).connection(lb))
}

pub(crate) fn context(
  driver: &MemoryDriver,
  config: &DatabasesConfig,
) -> Arc<DbContext<MemoryDriver>> {
  let ctx = Arc::new(DbContext::with_seed(driver.clone(), ExecutorConfig::default(), 7));
  ctx.apply_config(config);
  ctx
}

pub(crate) fn program(
  ctx: &Arc<DbContext<MemoryDriver>>,
  name: &str,
  parameters: &[&str],
) -> Arc<Program<MemoryDriver>> {
  ctx
    .program(
      Some(DATABASE),
      LB,
      name,
      parameters.iter().map(|el| ProgramParameter::new(el)).collect(),
      ProgramOptions::default(),
    )
    .unwrap()
}
