//! Database drivers
//!
//! A [`Driver`] opens physical connections and describes the programs exposed by them. Drivers
//! receive fully bound commands and must write output values back into
//! [`DbCommand::parameters`].

pub mod memory;

use crate::{
  parameter::Direction,
  schema::DatabaseSchema,
  topology::Connection,
  value::{Row, SqlType, SqlValue},
};
use core::{future::Future, time::Duration};
use std::sync::Arc;

/// Entry point of a database implementation.
pub trait Driver: Send + Sync + 'static {
  /// See [`DriverConnection`].
  type Connection: DriverConnection;

  /// Returns the programs exposed by the database behind `connection`. Implementations are
  /// allowed to cache schemas unless `force_reload` is set.
  fn load_schema(
    &self,
    connection: &Connection,
    force_reload: bool,
  ) -> impl Future<Output = crate::Result<Arc<DatabaseSchema>>> + Send;

  /// Opens a new physical connection. Connections are closed when dropped.
  fn open(&self, connection: &Connection)
    -> impl Future<Output = crate::Result<Self::Connection>> + Send;
}

/// An opened physical connection.
pub trait DriverConnection: Send + 'static {
  /// See [`Cursor`].
  type Cursor: Cursor;

  /// Sends `command` and returns a cursor positioned at the first result set.
  ///
  /// Output values are written into the parameters of `command`.
  fn execute(
    &mut self,
    command: &mut DbCommand,
  ) -> impl Future<Output = crate::Result<Self::Cursor>> + Send;
}

/// Forward-only iterator over the result sets of a command.
pub trait Cursor: Send + 'static {
  /// Next row of the current result set. `None` once the set is exhausted.
  fn next_row(&mut self) -> impl Future<Output = crate::Result<Option<Row>>> + Send;

  /// Moves to the next result set. `false` if there are no more sets.
  fn next_result(&mut self) -> impl Future<Output = crate::Result<bool>> + Send;

  /// Number of records modified by the current result set.
  fn records_affected(&self) -> u64;
}

/// A parameter sent to the database.
#[derive(Clone, Debug, PartialEq)]
pub struct DbParameter {
  /// Direction
  pub direction: Direction,
  /// Declared name
  pub name: String,
  /// Declared type
  pub ty: SqlType,
  /// Sent value or, after the execution, the value written by the database.
  pub value: SqlValue,
}

/// Binds a parameter of a batch statement to an element of [`DbCommand::parameters`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParameterBinding {
  /// Index in the combined parameter list
  pub index: usize,
  /// Name of the parameter in the statement
  pub name: String,
}

/// One program invocation inside a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchStatement {
  /// Parameters of the invocation. Statements that share an element read what previous
  /// statements wrote into it.
  pub bindings: Vec<ParameterBinding>,
  /// Name of the program
  pub program: String,
}

/// What a command invokes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandKind {
  /// Several programs executed in order within a single round-trip. Each statement produces
  /// one result set.
  Batch(Vec<BatchStatement>),
  /// A single program that receives every parameter.
  Program(String),
}

/// A command ready to be sent.
#[derive(Clone, Debug, PartialEq)]
pub struct DbCommand {
  /// Invocation
  pub kind: CommandKind,
  /// Physical parameters
  pub parameters: Vec<DbParameter>,
  /// Timeout informed to the database. Zero waits forever.
  pub timeout: Duration,
}
