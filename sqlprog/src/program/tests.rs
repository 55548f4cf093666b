use crate::{
  driver::memory::MemoryDriver,
  program::ProgramError,
  tests::{context, databases, program, register_double, PRIMARY, REPLICA},
  topology::Connection,
  Error,
};
use std::sync::Arc;

fn normalized(connection_string: &str) -> String {
  Connection::new(connection_string, 1.0, 0).normalized().into()
}

#[tokio::test]
async fn mappings_are_validated_lazily_once() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0), (REPLICA, 1.0, 0)]));
  let program = program(&ctx, "spDouble", &["@Value", "@Result"]);
  assert_eq!(driver.schema_loads(), 0);
  assert_eq!(program.mappings().await.unwrap().len(), 2);
  assert_eq!(program.mappings().await.unwrap().len(), 2);
  assert_eq!(driver.schema_loads(), 2);
}

#[tokio::test]
async fn later_issued_requests_are_not_overwritten() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let program = program(&ctx, "spDouble", &["@Value", "@Result"]);
  program.validate_issued(2, false, false, true).await.unwrap();
  driver.hide_program(&normalized(PRIMARY), "spDouble");
  program.validate_issued(1, false, true, true).await.unwrap();
  assert_eq!(program.valid_mappings().len(), 1);
  assert_eq!(driver.schema_loads(), 1);
  let rslt = program.validate_issued(3, false, true, true).await;
  assert!(matches!(rslt, Err(Error::ProgramError(ProgramError::DefinitionNotFound { .. }))));
  assert!(program.valid_mappings().is_empty());
}

#[tokio::test]
async fn cached_failures_are_replayed_until_forced() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let program = program(&ctx, "spDouble", &["@Value", "@Result"]);
  driver.set_unreachable(&normalized(PRIMARY), true);
  program.validate(false, false, false).await.unwrap();
  assert_eq!(program.validation_errors().len(), 1);
  driver.set_unreachable(&normalized(PRIMARY), false);
  assert!(matches!(program.validate(false, false, true).await, Err(Error::Driver(_))));
  assert_eq!(driver.schema_loads(), 1);
  program.validate(false, true, true).await.unwrap();
  assert_eq!(driver.schema_loads(), 2);
  assert!(program.validation_errors().is_empty());
  assert_eq!(program.valid_mappings().len(), 1);
}

#[tokio::test]
async fn several_failures_are_aggregated() {
  let driver = MemoryDriver::new();
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0), (REPLICA, 1.0, 0)]));
  let program = program(&ctx, "spDouble", &[]);
  match program.validate(false, false, true).await {
    Err(Error::Aggregate(errors)) => {
      assert_eq!(errors.len(), 2);
      assert!(errors
        .iter()
        .all(|el| matches!(el, Error::ProgramError(ProgramError::DefinitionNotFound { .. }))));
    }
    rslt => panic!("unexpected {rslt:?}"),
  }
}

#[tokio::test]
async fn degraded_sets_keep_the_valid_connections() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  driver.set_unreachable(&normalized(REPLICA), true);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0), (REPLICA, 1.0, 0)]));
  let program = program(&ctx, "spDouble", &["@Value", "@Result"]);
  let mappings = program.mappings().await.unwrap();
  assert_eq!(mappings.len(), 1);
  assert_eq!(mappings[0].connection().normalized(), normalized(PRIMARY));
  let errors = program.validation_errors();
  assert_eq!(errors.len(), 1);
  assert_eq!(errors[0].0.normalized(), normalized(REPLICA));
  assert!(program.mapping_for(&normalized(REPLICA)).is_none());
  assert!(program.mapping_for(&normalized(PRIMARY)).is_some());
}

#[tokio::test]
async fn mappings_are_reused_while_the_schema_is_unchanged() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let program = program(&ctx, "spDouble", &["@Value", "@Result"]);
  program.validate(false, true, true).await.unwrap();
  let first = Arc::clone(&program.valid_mappings()[0]);
  program.validate(false, true, true).await.unwrap();
  assert!(Arc::ptr_eq(&first, &program.valid_mappings()[0]));
  program.validate(true, true, true).await.unwrap();
  let ordered = Arc::clone(&program.valid_mappings()[0]);
  assert!(!Arc::ptr_eq(&first, &ordered));
  assert!(ordered.checked_order());
  register_double(&driver);
  program.validate(false, true, true).await.unwrap();
  assert!(!Arc::ptr_eq(&ordered, &program.valid_mappings()[0]));
}

#[tokio::test]
async fn positions_are_only_checked_on_demand() {
  let driver = MemoryDriver::new();
  register_double(&driver);
  let ctx = context(&driver, &databases(&[(PRIMARY, 1.0, 0)]));
  let program = program(&ctx, "spDouble", &["@Result", "@Value"]);
  program.validate(false, true, true).await.unwrap();
  let rslt = program.validate(true, true, true).await;
  assert!(matches!(
    rslt,
    Err(Error::ProgramError(ProgramError::ParameterOrderMismatch { expected: 1, received: 0, .. }))
  ));
  assert!(program.valid_mappings().is_empty());
}
