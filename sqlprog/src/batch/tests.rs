use crate::{
  batch::{Batch, BatchError, BatchState, MAX_BATCH_COMMANDS},
  concurrency::ConnectionKey,
  config::{ConnectionConfig, DatabaseConfig, DatabasesConfig, LoadBalancedConnectionConfig},
  driver::memory::MemoryDriver,
  executor::{ExecutionError, NonQuery, Scalar},
  parameter::ParameterSet,
  program::{Program, ProgramOptions, ProgramParameter},
  tests::{
    context, databases, program, register_double, register_host, DATABASE, PRIMARY, REPLICA,
  },
  topology::Connection,
  DbContext, Error,
};
use core::time::Duration;
use std::sync::Arc;

const A: &str = "Server=a;Database=app";
const B: &str = "Server=b;Database=app";
const C: &str = "Server=c;Database=app";

fn normalized(connection_string: &str) -> String {
  Connection::new(connection_string, 1.0, 0).normalized().into()
}

fn lb(id: &str, connections: &[&str]) -> LoadBalancedConnectionConfig {
  connections.iter().fold(LoadBalancedConnectionConfig::new(id), |acc, el| {
    acc.connection(ConnectionConfig::new(el).max_concurrency(1))
  })
}

fn scattered(driver: &MemoryDriver) -> Arc<DbContext<MemoryDriver>> {
  let database = DatabaseConfig::new(Some(DATABASE))
    .connection(lb("ab", &[A, B]))
    .connection(lb("bc", &[B, C]))
    .connection(lb("c", &[C]));
  context(driver, &DatabasesConfig::new().database(database))
}

fn on(
  ctx: &Arc<DbContext<MemoryDriver>>,
  lb: &str,
  name: &str,
  parameters: &[&str],
) -> Arc<Program<MemoryDriver>> {
  let parameters = parameters.iter().map(|el| ProgramParameter::new(el)).collect();
  ctx.program(Some(DATABASE), lb, name, parameters, ProgramOptions::default()).unwrap()
}

fn double_parameters(value: i32) -> ParameterSet {
  let mut parameters = ParameterSet::new();
  let _ = parameters.input("@Value", value);
  parameters
}

#[tokio::test]
async fn the_only_common_connection_is_chosen() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  register_host(&driver);
  let ctx = scattered(&driver);
  let host = on(&ctx, "ab", "spHost", &[]);
  let double = on(&ctx, "bc", "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  let host_rslt = batch.add(&host, ParameterSet::new(), Scalar::<String>::new()).unwrap();
  let mut parameters = double_parameters(3);
  let doubled = parameters.output::<i32>("@Result");
  let double_rslt = batch.add(&double, parameters, NonQuery).unwrap();
  for _ in 0..10 {
    assert_eq!(batch.determine_connection().await.unwrap(), normalized(B));
  }
  batch.execute(None).await.unwrap();
  assert_eq!(host_rslt.get().await.unwrap(), Some(normalized(B)));
  assert_eq!(double_rslt.get().await.unwrap(), 1);
  assert_eq!(doubled.get().unwrap().unwrap(), 6);
  assert_eq!((driver.opened(), driver.executions(), driver.active()), (1, 1, 0));
  let semaphore = ctx.registry().connection_semaphore(&ConnectionKey::new(B)).unwrap();
  assert_eq!(semaphore.available(), semaphore.max_count());
}

#[tokio::test]
async fn outputs_feed_subsequent_commands() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  let mut first = double_parameters(5);
  let first_output = first.output::<i32>("@Result");
  let mut second = ParameterSet::new();
  let _ = second.input_from("@Value", &first_output);
  let second_output = second.output::<i32>("@Result");
  let _first_rslt = batch.add(&double, first, NonQuery).unwrap();
  let second_rslt = batch.add(&double, second, Scalar::<i32>::new()).unwrap();
  batch.execute(None).await.unwrap();
  assert_eq!(second_rslt.get().await.unwrap(), Some(10));
  assert_eq!(first_output.get().unwrap().unwrap(), 10);
  assert_eq!(second_output.get().unwrap().unwrap(), 20);
}

#[tokio::test]
async fn undeclared_outputs_are_reported() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  let mut foreign = ParameterSet::new();
  let foreign_output = foreign.output::<i32>("@Result");
  let mut parameters = ParameterSet::new();
  let _ = parameters.input_from("@Value", &foreign_output);
  let rslt = batch.add(&double, parameters, NonQuery).unwrap();
  let err = batch.execute(None).await.unwrap_err();
  assert!(matches!(&err, Error::ProgramExecution { program, .. } if program == "batch(spDouble)"));
  assert!(matches!(
    err.root_cause(),
    Error::BatchError(BatchError::UndeclaredOutput { command: 0, parameter })
      if parameter == "@Value"
  ));
  assert_eq!(driver.opened(), 0);
  let outcomes = rslt.get_all().await.unwrap();
  assert_eq!(outcomes.len(), 1);
  assert_eq!(outcomes[0].0, normalized(PRIMARY));
  assert!(outcomes[0].1.is_err());
}

#[tokio::test(start_paused = true)]
async fn concurrent_executions_share_one_outcome() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  driver.set_delay(Some(Duration::from_millis(20)));
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  let rslt = batch.add(&double, double_parameters(1), NonQuery).unwrap();
  assert_eq!(batch.state(), BatchState::Building);
  let (lhs, rhs) = tokio::join!(batch.execute(None), batch.execute(None));
  assert!(lhs.is_ok() && rhs.is_ok());
  assert_eq!(driver.executions(), 1);
  assert_eq!(batch.state(), BatchState::Completed);
  batch.execute(None).await.unwrap();
  assert_eq!(driver.executions(), 1);
  assert_eq!(rslt.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn commands_are_rejected_after_the_execution() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  let _rslt = batch.add(&double, double_parameters(1), NonQuery).unwrap();
  batch.execute(None).await.unwrap();
  assert!(matches!(
    batch.add(&double, double_parameters(2), NonQuery),
    Err(Error::BatchError(BatchError::InvalidState {
      expected: BatchState::Building,
      received: BatchState::Completed
    }))
  ));
  assert!(matches!(
    batch.execute_all(None).await,
    Err(Error::BatchError(BatchError::InvalidState { .. }))
  ));
}

#[tokio::test]
async fn disjoint_programs_have_no_common_connection() {
  let driver = MemoryDriver::new();
  register_host(&driver);
  let ctx = scattered(&driver);
  let batch = Batch::new(&ctx);
  let lhs = batch.add(&on(&ctx, "ab", "spHost", &[]), ParameterSet::new(), NonQuery).unwrap();
  let _rhs = batch.add(&on(&ctx, "c", "spHost", &[]), ParameterSet::new(), NonQuery).unwrap();
  assert!(matches!(
    batch.determine_connection().await,
    Err(Error::BatchError(BatchError::NoCommonConnection))
  ));
  let err = batch.execute(None).await.unwrap_err();
  assert!(err.is_topology());
  let outcomes = lhs.get_all().await.unwrap();
  assert_eq!(outcomes[0].0, "");
  assert!(matches!(outcomes[0].1, Err(Error::BatchError(BatchError::NoCommonConnection))));
  assert_eq!(driver.opened(), 0);
}

#[tokio::test]
async fn execute_all_runs_once_per_common_connection() {
  let driver = MemoryDriver::new();
  register_host(&driver);
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0), (REPLICA, 1.0, 0)]));
  let host = program(&ctx, "spHost", &[]);
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  host.validate(false, false, true).await.unwrap();
  double.validate(false, false, true).await.unwrap();
  driver.set_unreachable(&normalized(REPLICA), true);
  let batch = Batch::new(&ctx);
  let host_rslt = batch.add(&host, ParameterSet::new(), Scalar::<String>::new()).unwrap();
  let _double_rslt = batch.add(&double, double_parameters(4), NonQuery).unwrap();
  let outcomes = batch.execute_all(None).await.unwrap();
  assert_eq!(outcomes.len(), 2);
  assert_eq!(outcomes[0].0, normalized(PRIMARY));
  assert!(outcomes[0].1.is_ok());
  assert_eq!(outcomes[1].0, normalized(REPLICA));
  assert!(matches!(outcomes[1].1, Err(Error::ProgramExecution { .. })));
  let hosts = host_rslt.get_all().await.unwrap();
  assert_eq!(hosts.len(), 2);
  let primary = hosts.iter().find(|el| el.0 == normalized(PRIMARY)).unwrap();
  assert_eq!(primary.1.as_ref().unwrap().as_deref(), Some(normalized(PRIMARY).as_str()));
  let replica = hosts.iter().find(|el| el.0 == normalized(REPLICA)).unwrap();
  assert!(replica.1.is_err());
  assert_eq!(driver.executions(), 1);
}

#[tokio::test]
async fn dropped_batches_never_deliver() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  let rslt = batch.add(&double, double_parameters(1), NonQuery).unwrap();
  drop(batch);
  assert!(matches!(rslt.get().await, Err(Error::BatchError(BatchError::NotExecuted))));
}

#[tokio::test]
async fn capacity_is_limited() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  for _ in 0..MAX_BATCH_COMMANDS {
    let _rslt = batch.add(&double, ParameterSet::new(), NonQuery).unwrap();
  }
  assert_eq!(batch.len(), MAX_BATCH_COMMANDS);
  assert!(matches!(
    batch.add(&double, ParameterSet::new(), NonQuery),
    Err(Error::BatchError(BatchError::Full))
  ));
}

#[tokio::test(start_paused = true)]
async fn interrupted_executions_complete_as_cancelled() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  driver.set_delay(Some(Duration::from_millis(500)));
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  let rslt = batch.add(&double, double_parameters(1), NonQuery).unwrap();
  assert!(tokio::time::timeout(Duration::from_millis(50), batch.execute(None)).await.is_err());
  assert_eq!(batch.state(), BatchState::Completed);
  assert!(matches!(
    batch.execute(None).await,
    Err(Error::ExecutionError(ExecutionError::Cancelled))
  ));
  assert!(matches!(rslt.get().await, Err(Error::ExecutionError(ExecutionError::Cancelled))));
  assert_eq!((driver.executions(), driver.active()), (0, 0));
  let semaphore =
    ctx.registry().connection_semaphore(&ConnectionKey::new(PRIMARY)).unwrap();
  assert_eq!(semaphore.available(), semaphore.max_count());
}

#[tokio::test]
async fn missing_result_sets_fail_the_remaining_commands() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  driver.set_max_result_sets(Some(1));
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let double = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let batch = Batch::new(&ctx);
  let first = batch.add(&double, double_parameters(1), NonQuery).unwrap();
  let second = batch.add(&double, double_parameters(2), NonQuery).unwrap();
  let err = batch.execute(None).await.unwrap_err();
  assert!(matches!(err, Error::ProgramExecution { .. }));
  assert!(matches!(
    err.root_cause(),
    Error::BatchError(BatchError::MissingResultSet { command: 1 })
  ));
  assert!(first.get().await.is_ok());
  let outcome = second.get().await.unwrap_err();
  assert!(matches!(
    outcome.root_cause(),
    Error::BatchError(BatchError::MissingResultSet { command: 1 })
  ));
  assert_eq!(driver.active(), 0);
}
