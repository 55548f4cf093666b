//! Several program invocations sent to a single connection within a single round-trip.
//!
//! Commands are queued while the batch is building. The first execution moves the batch to
//! executing, concurrent executions wait for the same outcome and executions issued after the
//! batch completed return the stored outcome without touching the database.
//!
//! Outputs of a command can feed inputs of subsequent commands through
//! [`ParameterSet::input_from`].

mod connection_choice;
#[cfg(test)]
mod tests;

use crate::{
  driver::{
    BatchStatement, CommandKind, Cursor, DbCommand, DbParameter, Driver, DriverConnection,
    ParameterBinding,
  },
  executor::{DriverCursor, ExecutionError, ExecutionResources, Outputs, ResultShape},
  misc::{deadline_after, until},
  parameter::ParameterSet,
  program::Program,
  sync::{acquire_all, AdmissionSemaphore},
  DbContext, Error,
};
pub use connection_choice::{blend_scores, weight_shares};
use core::{
  fmt::{Debug, Formatter},
  sync::atomic::{AtomicU8, Ordering},
  time::Duration,
};
use futures::future::{join_all, BoxFuture};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, OnceCell};
use tokio_util::sync::CancellationToken;

/// Maximum number of commands of a batch.
pub const MAX_BATCH_COMMANDS: usize = 65_536;

/// Errors of [`Batch`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BatchError {
  /// The batch already has [`MAX_BATCH_COMMANDS`] commands.
  Full,
  /// The operation isn't allowed in the current state.
  InvalidState {
    /// Required state
    expected: BatchState,
    /// Current state
    received: BatchState,
  },
  /// There is no connection string that is valid for every program of the batch.
  NoCommonConnection,
  /// A command references an output that wasn't declared by a previous command.
  UndeclaredOutput {
    /// Sequence number of the referencing command
    command: u16,
    /// Name of the referencing parameter
    parameter: String,
  },
  /// The batch was dropped before being executed.
  NotExecuted,
  /// The database returned fewer result sets than there are commands.
  MissingResultSet {
    /// Sequence number of the first command without a result set
    command: u16,
  },
}

/// See [`Batch`].
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum BatchState {
  /// Commands can be added.
  Building = 0,
  /// Commands are being sent.
  Executing = 1,
  /// The outcome is known.
  Completed = 2,
}

impl BatchState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => Self::Building,
      1 => Self::Executing,
      _ => Self::Completed,
    }
  }
}

/// Outcome of a single command, available after the whole batch completed.
#[derive(Debug)]
pub struct BatchResult<T> {
  receiver: oneshot::Receiver<Vec<(String, crate::Result<T>)>>,
}

impl<T> BatchResult<T> {
  /// Outcome of the first connection that executed the command. See [`Self::get_all`].
  #[inline]
  pub async fn get(self) -> crate::Result<T> {
    match self.get_all().await?.into_iter().next() {
      Some((_, elem)) => elem,
      None => Err(BatchError::NotExecuted.into()),
    }
  }

  /// Outcomes of every connection that executed the command, along with their normalized
  /// connection strings. The string is empty if no connection could be chosen.
  #[inline]
  pub async fn get_all(self) -> crate::Result<Vec<(String, crate::Result<T>)>> {
    self.receiver.await.map_err(|_err| BatchError::NotExecuted.into())
  }
}

#[derive(Clone, Debug)]
enum Outcome {
  All(crate::Result<Vec<(String, crate::Result<()>)>>),
  Single(crate::Result<()>),
}

/// Ordered set of invocations executed against one shared connection.
pub struct Batch<D>
where
  D: Driver,
{
  commands: Mutex<Vec<BatchCommand<D>>>,
  ctx: Arc<DbContext<D>>,
  interrupted: Mutex<Option<Outcome>>,
  outcome: OnceCell<Outcome>,
  state: AtomicU8,
  timeout: Duration,
}

impl<D> Batch<D>
where
  D: Driver,
{
  /// Empty batch whose timeout is [`crate::config::ExecutorConfig::default_program_timeout`].
  #[inline]
  pub fn new(ctx: &Arc<DbContext<D>>) -> Self {
    Self::with_timeout(ctx, ctx.config().default_program_timeout)
  }

  /// Empty batch with a custom timeout. Zero waits forever.
  #[inline]
  pub fn with_timeout(ctx: &Arc<DbContext<D>>, timeout: Duration) -> Self {
    Self {
      commands: Mutex::new(Vec::new()),
      ctx: Arc::clone(ctx),
      interrupted: Mutex::new(None),
      outcome: OnceCell::new(),
      state: AtomicU8::new(BatchState::Building as u8),
      timeout,
    }
  }

  /// Queues an invocation of `program`. The returned handle receives what `shape` extracts
  /// from the result set of this command once the batch completes.
  #[inline]
  pub fn add<S>(
    &self,
    program: &Arc<Program<D>>,
    parameters: ParameterSet,
    shape: S,
  ) -> crate::Result<BatchResult<S::Output>>
  where
    S: Clone + ResultShape + Sync + 'static,
  {
    let mut commands = self.commands.lock();
    let received = self.state();
    if received != BatchState::Building {
      return Err(BatchError::InvalidState { expected: BatchState::Building, received }.into());
    }
    if commands.len() >= MAX_BATCH_COMMANDS {
      return Err(BatchError::Full.into());
    }
    let id = u16::try_from(commands.len()).map_err(|_err| BatchError::Full)?;
    let (sender, receiver) = oneshot::channel();
    let sink =
      ShapeSink { records: Mutex::new(Vec::new()), sender: Mutex::new(Some(sender)), shape };
    commands.push(BatchCommand {
      id,
      parameters,
      program: Arc::clone(program),
      sink: Arc::new(sink),
    });
    Ok(BatchResult { receiver })
  }

  /// Connection string, in its normalized form, that would receive the batch.
  ///
  /// Only connections with a valid mapping and a positive weight in every program are
  /// considered. A single candidate is returned as is, otherwise candidates are picked
  /// according to [`blend_scores`].
  #[inline]
  pub async fn determine_connection(&self) -> crate::Result<String> {
    let programs = distinct_programs(&self.commands.lock());
    self.choose_connection(&programs).await
  }

  /// Executes every command against the connection returned by
  /// [`Self::determine_connection`].
  ///
  /// Dropping the returned future before it completes cancels the batch: every result handle
  /// and every subsequent execution observe [`ExecutionError::Cancelled`].
  #[inline]
  pub async fn execute(&self, cancel: Option<&CancellationToken>) -> crate::Result<()> {
    self.begin();
    let outcome = self
      .outcome
      .get_or_init(|| async {
        let interrupted = self.interrupted.lock().take();
        match interrupted {
          Some(elem) => elem,
          None => Outcome::Single(self.run_single(cancel).await),
        }
      })
      .await;
    match outcome {
      Outcome::All(_) => Err(self.completed_error()),
      Outcome::Single(elem) => elem.clone(),
    }
  }

  /// Executes every command once per connection string that is common to all programs,
  /// concurrently. Every execution is awaited regardless of failures.
  ///
  /// Cancellation through drops behaves like [`Self::execute`].
  #[inline]
  pub async fn execute_all(
    &self,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<Vec<(String, crate::Result<()>)>> {
    self.begin();
    let outcome = self
      .outcome
      .get_or_init(|| async {
        let interrupted = self.interrupted.lock().take();
        match interrupted {
          Some(elem) => elem,
          None => Outcome::All(self.run_all(cancel).await),
        }
      })
      .await;
    match outcome {
      Outcome::All(elem) => elem.clone(),
      Outcome::Single(_) => Err(self.completed_error()),
    }
  }

  /// If there are no commands.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.commands.lock().is_empty()
  }

  /// Number of commands.
  #[inline]
  pub fn len(&self) -> usize {
    self.commands.lock().len()
  }

  /// Current state
  #[inline]
  pub fn state(&self) -> BatchState {
    BatchState::from_u8(self.state.load(Ordering::Acquire))
  }

  fn begin(&self) {
    let _ = self.state.compare_exchange(
      BatchState::Building as u8,
      BatchState::Executing as u8,
      Ordering::AcqRel,
      Ordering::Acquire,
    );
  }

  // Connection strings that are valid, with a positive weight, in every program along with
  // the weights assigned by each program.
  async fn common_connections(
    &self,
    programs: &[Arc<Program<D>>],
  ) -> crate::Result<Vec<Vec<(String, f64)>>> {
    let mut rslt: Vec<Vec<(String, f64)>> = Vec::with_capacity(programs.len());
    for program in programs {
      let mut weights: Vec<(String, f64)> = Vec::new();
      for mapping in program.mappings().await? {
        let connection = mapping.connection();
        if !connection.is_selectable() {
          continue;
        }
        match weights.iter_mut().find(|el| el.0 == connection.normalized()) {
          Some(elem) => elem.1 += connection.weight(),
          None => weights.push((connection.normalized().into(), connection.weight())),
        }
      }
      if let Some(first) = rslt.first() {
        weights.retain(|el| first.iter().any(|local| local.0 == el.0));
      }
      for prev in &mut rslt {
        prev.retain(|el| weights.iter().any(|local| local.0 == el.0));
      }
      if weights.is_empty() {
        return Err(BatchError::NoCommonConnection.into());
      }
      rslt.push(weights);
    }
    if rslt.is_empty() {
      return Err(BatchError::NoCommonConnection.into());
    }
    Ok(rslt)
  }

  async fn choose_connection(&self, programs: &[Arc<Program<D>>]) -> crate::Result<String> {
    let common = self.common_connections(programs).await?;
    let candidates = common.first().map(Vec::as_slice).unwrap_or_default();
    if let [(connection, _)] = candidates {
      return Ok(connection.clone());
    }
    let shares: Vec<_> = common.iter().map(|el| weight_shares(el)).collect();
    let scores = blend_scores(&shares);
    match self.ctx.pick(&scores, |el| el.1) {
      Some((connection, _)) => Ok(connection.clone()),
      None => Err(BatchError::NoCommonConnection.into()),
    }
  }

  fn completed_error(&self) -> Error {
    BatchError::InvalidState { expected: BatchState::Building, received: self.state() }.into()
  }

  fn label(commands: &[BatchCommand<D>]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for command in commands {
      if !names.contains(&command.program.name()) {
        names.push(command.program.name());
      }
    }
    format!("batch({})", names.join(", "))
  }

  async fn run_all(
    &self,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<Vec<(String, crate::Result<()>)>> {
    let mut run = Run::new(self, true);
    let label = Self::label(&run.commands);
    _debug!(
      batch = %label,
      commands = run.commands.len(),
      "Batch execution started on all connections"
    );
    let common = self.common_connections(&distinct_programs(&run.commands)).await;
    let rslt = match common {
      Ok(elem) => {
        let connections: Vec<String> = elem
          .first()
          .map(|local| local.iter().map(|el| el.0.clone()).collect())
          .unwrap_or_default();
        run.connections.clone_from(&connections);
        let label = label.as_str();
        let commands = run.commands.as_slice();
        let outcomes = join_all(connections.iter().map(|connection| async move {
          self
            .run_on(commands, connection, cancel)
            .await
            .map_err(|err| Error::wrap_execution(label, err))
        }))
        .await;
        for (connection, outcome) in connections.iter().zip(&outcomes) {
          if let Err(err) = outcome {
            fail_all(commands, connection, err);
          }
        }
        Ok(connections.into_iter().zip(outcomes).collect())
      }
      Err(err) => {
        fail_all(&run.commands, "", &err);
        Err(err)
      }
    };
    run.finish();
    rslt
  }

  async fn run_on(
    &self,
    commands: &[BatchCommand<D>],
    normalized: &str,
    cancel: Option<&CancellationToken>,
  ) -> crate::Result<()> {
    let mut mappings = Vec::with_capacity(commands.len());
    for command in commands {
      let Some(mapping) = command.program.mapping_for(normalized) else {
        return Err(BatchError::NoCommonConnection.into());
      };
      mappings.push(mapping);
    }
    let Some(connection) = mappings.first().map(|el| Arc::clone(el.connection())) else {
      return Err(BatchError::NoCommonConnection.into());
    };
    let mut outputs: Outputs = Vec::new();
    let mut parameters: Vec<DbParameter> = Vec::new();
    let mut registered: HashMap<u64, usize> = HashMap::new();
    let mut statements = Vec::with_capacity(commands.len());
    let mut semaphores: [Vec<Arc<AdmissionSemaphore>>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for (command, mapping) in commands.iter().zip(&mappings) {
      let program = &command.program;
      let bound = mapping.bind(&command.parameters, program.options().constraint_mode)?;
      let mut indices = Vec::with_capacity(bound.parameters.len());
      let mut bindings = Vec::with_capacity(bound.parameters.len());
      for (local_idx, parameter) in bound.parameters.into_iter().enumerate() {
        let chained = bound.chained.iter().find(|el| el.0 == local_idx).map(|el| el.1);
        let index = match chained {
          Some(id) => match registered.get(&id) {
            Some(elem) => *elem,
            None => {
              return Err(
                BatchError::UndeclaredOutput { command: command.id, parameter: parameter.name }
                  .into(),
              );
            }
          },
          None => {
            parameters.push(parameter.clone());
            parameters.len().wrapping_sub(1)
          }
        };
        indices.push(index);
        bindings.push(ParameterBinding { index, name: parameter.name });
      }
      for (local_idx, slot) in bound.outputs {
        if let Some(index) = indices.get(local_idx) {
          let _prev = registered.insert(slot.id(), *index);
          outputs.push((*index, slot));
        }
      }
      statements.push(BatchStatement { bindings, program: mapping.program().into() });
      let chain = self.ctx.registry().execution_chain(
        program.connection(),
        mapping.connection(),
        program.name(),
      );
      for (kind, semaphore) in semaphores.iter_mut().zip(chain) {
        let Some(elem) = semaphore else {
          continue;
        };
        if !kind.iter().any(|local| Arc::ptr_eq(local, &elem)) {
          kind.push(elem);
        }
      }
    }
    let chain: Vec<_> = semaphores.into_iter().flatten().map(Some).collect();
    let deadline = deadline_after(self.timeout, self.ctx.config().additional_cancellation_time);
    let scope = acquire_all(&chain, deadline, cancel).await?;
    let physical = until(self.ctx.driver().open(&connection), deadline, cancel)
      .await
      .map_err(ExecutionError::from)??;
    let command =
      DbCommand { kind: CommandKind::Batch(statements), parameters, timeout: self.timeout };
    let mut resources = ExecutionResources::new(command, physical, scope);
    until(consume_all(&mut resources, commands, normalized), deadline, cancel)
      .await
      .map_err(ExecutionError::from)??;
    resources.finish(&outputs);
    Ok(())
  }

  async fn run_single(&self, cancel: Option<&CancellationToken>) -> crate::Result<()> {
    let mut run = Run::new(self, false);
    let label = Self::label(&run.commands);
    _debug!(batch = %label, commands = run.commands.len(), "Batch execution started");
    let rslt = match self.choose_connection(&distinct_programs(&run.commands)).await {
      Ok(connection) => {
        run.connections.push(connection.clone());
        let rslt = self
          .run_on(&run.commands, &connection, cancel)
          .await
          .map_err(|err| Error::wrap_execution(&label, err));
        if let Err(err) = &rslt {
          fail_all(&run.commands, &connection, err);
        }
        rslt
      }
      Err(err) => {
        fail_all(&run.commands, "", &err);
        Err(err)
      }
    };
    run.finish();
    rslt
  }

  fn finish(&self, commands: &[BatchCommand<D>]) {
    for command in commands {
      command.sink.complete();
    }
    self.state.store(BatchState::Completed as u8, Ordering::Release);
    _debug!(commands = commands.len(), "Batch execution finished");
  }
}

impl<D> Debug for Batch<D>
where
  D: Driver,
{
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Batch")
      .field("commands", &self.commands.lock().len())
      .field("state", &self.state())
      .field("timeout", &self.timeout)
      .finish()
  }
}

// Commands taken out of a batch for an execution. If the execution future is dropped midway,
// every command is failed as cancelled and the cancellation becomes the stored outcome.
struct Run<'batch, D>
where
  D: Driver,
{
  all: bool,
  batch: &'batch Batch<D>,
  commands: Vec<BatchCommand<D>>,
  connections: Vec<String>,
  is_finished: bool,
}

impl<'batch, D> Run<'batch, D>
where
  D: Driver,
{
  fn new(batch: &'batch Batch<D>, all: bool) -> Self {
    let commands = core::mem::take(&mut *batch.commands.lock());
    Self { all, batch, commands, connections: Vec::new(), is_finished: false }
  }

  fn finish(mut self) {
    self.is_finished = true;
    self.batch.finish(&self.commands);
  }
}

impl<D> Drop for Run<'_, D>
where
  D: Driver,
{
  fn drop(&mut self) {
    if self.is_finished {
      return;
    }
    let err = Error::from(ExecutionError::Cancelled);
    if self.connections.is_empty() {
      fail_all(&self.commands, "", &err);
    }
    for connection in &self.connections {
      fail_all(&self.commands, connection, &err);
    }
    let outcome =
      if self.all { Outcome::All(Err(err)) } else { Outcome::Single(Err(err)) };
    *self.batch.interrupted.lock() = Some(outcome);
    self.batch.finish(&self.commands);
  }
}

struct BatchCommand<D>
where
  D: Driver,
{
  id: u16,
  parameters: ParameterSet,
  program: Arc<Program<D>>,
  sink: Arc<dyn CommandSink<DriverCursor<D>>>,
}

// Type-erased storage of the outcomes of a command.
trait CommandSink<C>: Send + Sync {
  // Consumes the current result set of `cursor` and stores the outcome under `connection`.
  fn consume<'this>(
    &'this self,
    connection: &'this str,
    cursor: &'this mut C,
  ) -> BoxFuture<'this, crate::Result<()>>;

  // Stores `error` under `connection` unless something was already stored.
  fn fail(&self, connection: &str, error: &Error);

  // Delivers everything that was stored. Subsequent calls do nothing.
  fn complete(&self);
}

struct ShapeSink<S>
where
  S: ResultShape,
{
  records: Mutex<Vec<(String, crate::Result<S::Output>)>>,
  sender: Mutex<Option<oneshot::Sender<Vec<(String, crate::Result<S::Output>)>>>>,
  shape: S,
}

impl<C, S> CommandSink<C> for ShapeSink<S>
where
  C: Cursor,
  S: Clone + ResultShape + Sync,
{
  fn consume<'this>(
    &'this self,
    connection: &'this str,
    cursor: &'this mut C,
  ) -> BoxFuture<'this, crate::Result<()>> {
    Box::pin(async move {
      let rslt = self.shape.clone().consume(cursor).await;
      let outcome = match &rslt {
        Ok(_) => Ok(()),
        Err(err) => Err(err.clone()),
      };
      self.records.lock().push((connection.into(), rslt));
      outcome
    })
  }

  fn fail(&self, connection: &str, error: &Error) {
    let mut records = self.records.lock();
    if !records.iter().any(|el| el.0 == connection) {
      records.push((connection.into(), Err(error.clone())));
    }
  }

  fn complete(&self) {
    if let Some(sender) = self.sender.lock().take() {
      let _rslt = sender.send(core::mem::take(&mut *self.records.lock()));
    }
  }
}

async fn consume_all<D>(
  resources: &mut ExecutionResources<D::Connection>,
  commands: &[BatchCommand<D>],
  connection: &str,
) -> crate::Result<()>
where
  D: Driver,
{
  let (physical, command) = resources.connection_and_command()?;
  let mut cursor = physical.execute(command).await?;
  for (idx, elem) in commands.iter().enumerate() {
    if idx > 0 && !cursor.next_result().await? {
      return Err(BatchError::MissingResultSet { command: elem.id }.into());
    }
    elem.sink.consume(connection, &mut cursor).await?;
  }
  Ok(())
}

fn distinct_programs<D>(commands: &[BatchCommand<D>]) -> Vec<Arc<Program<D>>>
where
  D: Driver,
{
  let mut rslt: Vec<Arc<Program<D>>> = Vec::new();
  for command in commands {
    if !rslt.iter().any(|el| Arc::ptr_eq(el, &command.program)) {
      rslt.push(Arc::clone(&command.program));
    }
  }
  rslt
}

fn fail_all<D>(commands: &[BatchCommand<D>], connection: &str, error: &Error)
where
  D: Driver,
{
  for command in commands {
    command.sink.fail(connection, error);
  }
}
