//! Single-connection executions of programs.
//!
//! An execution acquires the admissions of the chosen connection, opens a physical
//! connection, runs the command under the combined deadline and cancellation and then
//! releases everything in a fixed order before delivering outputs.

mod result_shape;

use crate::{
  driver::{CommandKind, DbCommand, DbParameter, Driver, DriverConnection},
  misc::{deadline_after, until, DisposeOnce, Interruption},
  parameter::{ErasedOutput, ParameterSet},
  program::{Program, ProgramMapping},
  reader::{CursorSlot, ForwardOnlyReader, ReaderState, ReaderStateCell},
  sync::{acquire_all, AdmissionScope},
  topology::Connection,
  value::{FromSqlValue, Row, SqlValue},
  Error,
};
use core::{
  fmt::{Debug, Formatter},
  time::Duration,
};
use futures::future::join_all;
use parking_lot::Mutex;
pub use result_shape::{ForEachRow, NonQuery, ResultShape, Rows, Scalar, Xml};
use std::sync::{Arc, Weak};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

pub(crate) type DriverCursor<D> = <<D as Driver>::Connection as DriverConnection>::Cursor;
pub(crate) type Outputs = Vec<(usize, Arc<dyn ErasedOutput>)>;

/// Errors of executions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionError {
  /// The caller cancelled the execution.
  Cancelled,
  /// Outputs of other commands can only be referenced inside batches.
  ChainedInputOutsideBatch {
    /// Parameter name
    parameter: String,
  },
  /// None of the connections of the program has a valid mapping with a positive weight.
  NoValidMapping {
    /// Program name
    program: String,
  },
  /// The command timeout plus the additional cancellation time elapsed.
  TimedOut,
  /// The configuration doesn't declare the requested load-balanced connection.
  UnknownLoadBalancedConnection {
    /// Load-balanced connection identifier
    connection_id: String,
    /// Database identifier
    database_id: Option<String>,
  },
}

impl From<Interruption> for ExecutionError {
  #[inline]
  fn from(from: Interruption) -> Self {
    match from {
      Interruption::Cancelled => Self::Cancelled,
      Interruption::TimedOut => Self::TimedOut,
    }
  }
}

impl<D> Program<D>
where
  D: Driver,
{
  /// Picks a valid mapping, proportionally to the weights of the connections, to create a
  /// command. `timeout` defaults to the timeout of the program.
  #[inline]
  pub async fn create_command(
    self: &Arc<Self>,
    timeout: Option<Duration>,
  ) -> crate::Result<ProgramCommand<D>> {
    let mappings = self.mappings().await?;
    let Some(mapping) = self.ctx.pick(&mappings, |el| {
      if el.connection().is_selectable() {
        el.connection().weight()
      } else {
        0.0
      }
    }) else {
      return Err(ExecutionError::NoValidMapping { program: self.name.clone() }.into());
    };
    _trace!(
      program = %self.name,
      connection = mapping.connection().normalized(),
      "Connection selected"
    );
    Ok(ProgramCommand::new(self, Arc::clone(mapping), timeout))
  }

  /// Executes the program against one connection returning the result selected by `shape`.
  #[inline]
  pub async fn execute<S>(
    self: &Arc<Self>,
    parameters: &ParameterSet,
    shape: S,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<S::Output>
  where
    S: ResultShape,
  {
    self.create_command(None).await?.execute(parameters, shape, cancel).await
  }

  /// Executes the program against every connection with a valid mapping, concurrently.
  ///
  /// Every execution is awaited regardless of failures and each outcome is returned along with
  /// its connection.
  #[inline]
  pub async fn execute_all<S>(
    self: &Arc<Self>,
    parameters: &ParameterSet,
    shape: S,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<Vec<(Arc<Connection>, crate::Result<S::Output>)>>
  where
    S: Clone + ResultShape,
  {
    let mappings = self.mappings().await?;
    if mappings.is_empty() {
      return Err(ExecutionError::NoValidMapping { program: self.name.clone() }.into());
    }
    let commands: Vec<_> =
      mappings.into_iter().map(|el| ProgramCommand::new(self, el, None)).collect();
    let outcomes =
      join_all(commands.iter().map(|el| el.execute(parameters, shape.clone(), cancel))).await;
    Ok(commands.iter().map(|el| Arc::clone(el.mapping.connection())).zip(outcomes).collect())
  }

  /// Shortcut of [`Self::execute`] with [`NonQuery`].
  #[inline]
  pub async fn execute_non_query(
    self: &Arc<Self>,
    parameters: &ParameterSet,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<u64> {
    self.execute(parameters, NonQuery, cancel).await
  }

  /// Shortcut of [`ProgramCommand::execute_reader`].
  #[inline]
  pub async fn execute_reader(
    self: &Arc<Self>,
    parameters: &ParameterSet,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<ProgramReader<D>> {
    self.create_command(None).await?.execute_reader(parameters, cancel).await
  }

  /// Shortcut of [`Self::execute`] with [`Scalar`].
  #[inline]
  pub async fn execute_scalar<T>(
    self: &Arc<Self>,
    parameters: &ParameterSet,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<Option<T>>
  where
    T: FromSqlValue + Send + 'static,
  {
    self.execute(parameters, Scalar::new(), cancel).await
  }

  /// Shortcut of [`Self::execute`] with [`Xml`].
  #[inline]
  pub async fn execute_xml(
    self: &Arc<Self>,
    parameters: &ParameterSet,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<Option<String>> {
    self.execute(parameters, Xml, cancel).await
  }
}

/// A program bound to one of its mappings.
pub struct ProgramCommand<D> {
  mapping: Arc<ProgramMapping>,
  program: Arc<Program<D>>,
  timeout: Duration,
}

impl<D> ProgramCommand<D>
where
  D: Driver,
{
  fn new(
    program: &Arc<Program<D>>,
    mapping: Arc<ProgramMapping>,
    timeout: Option<Duration>,
  ) -> Self {
    let timeout = timeout
      .or(program.options.default_timeout)
      .unwrap_or(program.ctx.config().default_program_timeout);
    Self { mapping, program: Arc::clone(program), timeout }
  }

  /// Runs the command and extracts the result selected by `shape`.
  ///
  /// Failures other than cancellations, timeouts and topology problems are wrapped into
  /// [`Error::ProgramExecution`].
  #[inline]
  pub async fn execute<S>(
    &self,
    parameters: &ParameterSet,
    shape: S,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<S::Output>
  where
    S: ResultShape,
  {
    self
      .do_execute(parameters, shape, cancel)
      .await
      .map_err(|err| Error::wrap_execution(&self.program.name, err))
  }

  /// Runs the command and returns a reader over its result sets.
  ///
  /// If the command has a timeout or `cancel` is provided, a background task closes the reader
  /// and releases its resources once `timeout` plus the additional cancellation time elapses
  /// or `cancel` fires, whatever comes first.
  #[inline]
  pub async fn execute_reader(
    &self,
    parameters: &ParameterSet,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<ProgramReader<D>> {
    self
      .do_execute_reader(parameters, cancel)
      .await
      .map_err(|err| Error::wrap_execution(&self.program.name, err))
  }

  /// Selected mapping
  #[inline]
  pub fn mapping(&self) -> &Arc<ProgramMapping> {
    &self.mapping
  }

  /// Timeout informed to the database. Zero waits forever.
  #[inline]
  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  fn deadline(&self) -> Option<Instant> {
    deadline_after(self.timeout, self.program.ctx.config().additional_cancellation_time)
  }

  async fn do_execute<S>(
    &self,
    parameters: &ParameterSet,
    shape: S,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<S::Output>
  where
    S: ResultShape,
  {
    let deadline = self.deadline();
    let (mut resources, outputs) = self.prepare(parameters, deadline, cancel).await?;
    let consumed = until(run_and_consume(&mut resources, shape), deadline, cancel)
      .await
      .map_err(ExecutionError::from)??;
    resources.finish(&outputs);
    Ok(consumed)
  }

  async fn do_execute_reader(
    &self,
    parameters: &ParameterSet,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<ProgramReader<D>> {
    let deadline = self.deadline();
    let (mut resources, outputs) = self.prepare(parameters, deadline, cancel).await?;
    let cursor =
      until(run(&mut resources), deadline, cancel).await.map_err(ExecutionError::from)??;
    let resources = Arc::new(Mutex::new(resources));
    let state = Arc::new(ReaderStateCell::new());
    let teardown = CancellationToken::new();
    let reader = ForwardOnlyReader::with_state(cursor, Arc::clone(&state), Some(teardown.clone()));
    let watchdog = if deadline.is_some() || cancel.is_some() {
      Some(tokio::spawn(reader_watchdog(
        deadline,
        cancel.cloned(),
        Arc::downgrade(reader.cursor_slot()),
        Arc::downgrade(&resources),
        state,
        teardown,
      )))
    } else {
      None
    };
    Ok(ProgramReader { outputs, reader, resources, watchdog })
  }

  async fn prepare(
    &self,
    parameters: &ParameterSet,
    deadline: Option<Instant>,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<(ExecutionResources<D::Connection>, Outputs)> {
    let program = &self.program;
    let bound = self.mapping.bind(parameters, program.options.constraint_mode)?;
    if let Some((idx, _)) = bound.chained.first() {
      let parameter = bound.parameters.get(*idx).map(|el| el.name.clone()).unwrap_or_default();
      return Err(ExecutionError::ChainedInputOutsideBatch { parameter }.into());
    }
    let chain = program.ctx.registry().execution_chain(
      &program.connection,
      self.mapping.connection(),
      &program.name,
    );
    let scope = acquire_all(&chain, deadline, cancel).await?;
    let connection = until(program.ctx.driver().open(self.mapping.connection()), deadline, cancel)
      .await
      .map_err(ExecutionError::from)??;
    let command = DbCommand {
      kind: CommandKind::Program(self.mapping.program().into()),
      parameters: bound.parameters,
      timeout: self.timeout,
    };
    Ok((ExecutionResources::new(command, connection, scope), bound.outputs))
  }
}

impl<D> Debug for ProgramCommand<D> {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ProgramCommand")
      .field("mapping", &self.mapping)
      .field("program", &self.program.name)
      .field("timeout", &self.timeout)
      .finish()
  }
}

/// Reader returned by [`ProgramCommand::execute_reader`].
///
/// Closing or dropping the reader releases the cursor, the command, the connection and the
/// admissions, in this order, and then delivers output values.
pub struct ProgramReader<D>
where
  D: Driver,
{
  outputs: Outputs,
  reader: ForwardOnlyReader<DriverCursor<D>>,
  resources: Arc<Mutex<ExecutionResources<D::Connection>>>,
  watchdog: Option<JoinHandle<()>>,
}

impl<D> ProgramReader<D>
where
  D: Driver,
{
  /// See [`ForwardOnlyReader::close`].
  #[inline]
  pub fn close(&mut self) {
    let outputs = &self.outputs;
    let resources = &self.resources;
    // A locked cursor means that the watchdog is already tearing everything down.
    if self.reader.close_with(|| resources.lock().finish(outputs)) {
      if let Some(elem) = self.watchdog.take() {
        elem.abort();
      }
    }
  }

  /// See [`ForwardOnlyReader::field_count`].
  #[inline]
  pub fn field_count(&self) -> crate::Result<usize> {
    self.reader.field_count()
  }

  /// See [`ForwardOnlyReader::get`].
  #[inline]
  pub fn get<T>(&self, idx: usize) -> crate::Result<Option<T>>
  where
    T: FromSqlValue,
  {
    self.reader.get(idx)
  }

  /// See [`ForwardOnlyReader::next_result`].
  #[inline]
  pub async fn next_result(&mut self) -> crate::Result<bool> {
    self.reader.next_result().await
  }

  /// See [`ForwardOnlyReader::read`].
  #[inline]
  pub async fn read(&mut self) -> crate::Result<bool> {
    self.reader.read().await
  }

  /// See [`ForwardOnlyReader::records_affected`].
  #[inline]
  pub fn records_affected(&self) -> crate::Result<u64> {
    self.reader.records_affected()
  }

  /// See [`ForwardOnlyReader::row`].
  #[inline]
  pub fn row(&self) -> crate::Result<Option<&Row>> {
    self.reader.row()
  }

  /// See [`ForwardOnlyReader::state`].
  #[inline]
  pub fn state(&self) -> ReaderState {
    self.reader.state()
  }

  /// See [`ForwardOnlyReader::value`].
  #[inline]
  pub fn value(&self, idx: usize) -> crate::Result<Option<&SqlValue>> {
    self.reader.value(idx)
  }
}

impl<D> Debug for ProgramReader<D>
where
  D: Driver,
{
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ProgramReader").field("state", &self.reader.state()).finish()
  }
}

impl<D> Drop for ProgramReader<D>
where
  D: Driver,
{
  #[inline]
  fn drop(&mut self) {
    self.close();
  }
}

// Resources of an execution that outlive the cursor. Each one is disposed at most once and
// always after the ones declared before it.
pub(crate) struct ExecutionResources<C> {
  command: DisposeOnce<DbCommand>,
  connection: DisposeOnce<C>,
  scope: DisposeOnce<AdmissionScope>,
}

impl<C> ExecutionResources<C>
where
  C: DriverConnection,
{
  pub(crate) fn new(command: DbCommand, connection: C, scope: AdmissionScope) -> Self {
    Self {
      command: DisposeOnce::new(command),
      connection: DisposeOnce::new(connection),
      scope: DisposeOnce::new(scope),
    }
  }

  pub(crate) fn connection_and_command(&mut self) -> crate::Result<(&mut C, &mut DbCommand)> {
    match (self.connection.get_mut(), self.command.get_mut()) {
      (Some(connection), Some(command)) => Ok((connection, command)),
      _ => Err(ExecutionError::Cancelled.into()),
    }
  }

  // Releases everything and then delivers outputs. Subsequent calls do nothing.
  pub(crate) fn finish(&mut self, outputs: &[(usize, Arc<dyn ErasedOutput>)]) {
    let command = self.command.take();
    self.release();
    if let Some(elem) = command {
      propagate_outputs(outputs, &elem.parameters);
    }
  }
}

impl<C> ExecutionResources<C> {
  fn release(&mut self) {
    let _ = self.command.dispose();
    let _ = self.connection.dispose();
    let _ = self.scope.dispose();
  }
}

impl<C> Drop for ExecutionResources<C> {
  #[inline]
  fn drop(&mut self) {
    self.release();
  }
}

async fn run<C>(resources: &mut ExecutionResources<C>) -> crate::Result<C::Cursor>
where
  C: DriverConnection,
{
  let (connection, command) = resources.connection_and_command()?;
  connection.execute(command).await
}

async fn run_and_consume<C, S>(
  resources: &mut ExecutionResources<C>,
  shape: S,
) -> crate::Result<S::Output>
where
  C: DriverConnection,
  S: ResultShape,
{
  let mut cursor = run(resources).await?;
  shape.consume(&mut cursor).await
}

fn propagate_outputs(
  outputs: &[(usize, Arc<dyn ErasedOutput>)],
  parameters: &[DbParameter],
) {
  for (idx, slot) in outputs {
    if let Some(parameter) = parameters.get(*idx) {
      slot.set(&parameter.value);
    }
  }
}

// Pending reader operations are aborted through `teardown` so that the cursor can be locked
// and released before everything else.
async fn reader_watchdog<C>(
  deadline: Option<Instant>,
  cancel: Option<CancellationToken>,
  cursor: Weak<CursorSlot<C::Cursor>>,
  resources: Weak<Mutex<ExecutionResources<C>>>,
  state: Arc<ReaderStateCell>,
  teardown: CancellationToken,
) where
  C: DriverConnection,
{
  let _ = until(core::future::pending::<()>(), deadline, cancel.as_ref()).await;
  if state.advance(ReaderState::Closed) {
    _warn!("Reader closed by the execution watchdog");
  }
  teardown.cancel();
  let Some(slot) = cursor.upgrade() else {
    return;
  };
  let mut local_cursor = slot.lock().await;
  let _ = local_cursor.dispose();
  if let Some(elem) = resources.upgrade() {
    elem.lock().release();
  }
}
