//! Scripted driver that keeps everything in memory.
//!
//! Programs are closures registered together with their definitions. Connections can be
//! marked as unreachable, definitions can be hidden from specific connections and every
//! execution can be delayed, which allows the simulation of partially available topologies.

use crate::{
  driver::{CommandKind, Cursor, DbCommand, DbParameter, Driver, DriverConnection},
  parameter::normalize_parameter_name,
  schema::{DatabaseSchema, ProgramDefinition},
  topology::Connection,
  value::{Row, SqlValue},
  Error,
};
use core::{
  fmt::{Debug, Display, Formatter},
  sync::atomic::{AtomicU64, AtomicUsize, Ordering},
  time::Duration,
};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use std::{collections::VecDeque, sync::Arc};

type Handler = dyn Fn(&mut MemoryCall<'_>) -> crate::Result<MemoryResultSet> + Send + Sync;

/// Errors of [`MemoryDriver`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemoryError {
  /// Failure raised by a handler.
  Failure(String),
  /// No handler was registered for the program.
  UnknownProgram(String),
  /// The connection was marked as unreachable.
  Unreachable(String),
}

impl Display for MemoryError {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    <Self as Debug>::fmt(self, f)
  }
}

impl core::error::Error for MemoryError {}

/// Rows and counters produced by one program invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryResultSet {
  /// Number of modified records
  pub records_affected: u64,
  /// Returned rows
  pub rows: Vec<Row>,
}

impl MemoryResultSet {
  /// Set without rows that modified `records_affected` records.
  #[inline]
  pub fn affected(records_affected: u64) -> Self {
    Self { records_affected, rows: Vec::new() }
  }

  /// Set with the given rows.
  #[inline]
  pub fn rows(rows: impl IntoIterator<Item = Row>) -> Self {
    Self { records_affected: 0, rows: rows.into_iter().collect() }
  }

  /// Set with a single row of a single value.
  #[inline]
  pub fn scalar(value: impl Into<SqlValue>) -> Self {
    Self::rows([Row::new(vec![value.into()])])
  }
}

/// Invocation received by a handler.
pub struct MemoryCall<'cmd> {
  bindings: Vec<(String, usize)>,
  connection: &'cmd str,
  parameters: &'cmd mut [DbParameter],
  program: &'cmd str,
}

impl MemoryCall<'_> {
  /// Normalized connection string of the connection that received the call.
  #[inline]
  pub fn connection(&self) -> &str {
    self.connection
  }

  /// Value of the parameter named `name`. Return values and omitted parameters are `None`.
  #[inline]
  pub fn get(&self, name: &str) -> Option<&SqlValue> {
    let idx = self.index(name)?;
    self.parameters.get(idx).map(|el| &el.value)
  }

  /// Program name
  #[inline]
  pub fn program(&self) -> &str {
    self.program
  }

  /// Writes into an output parameter. Returns `false` if there is no such parameter.
  #[inline]
  pub fn set(&mut self, name: &str, value: impl Into<SqlValue>) -> bool {
    let Some(idx) = self.index(name) else {
      return false;
    };
    match self.parameters.get_mut(idx) {
      Some(elem) => {
        elem.value = value.into();
        true
      }
      None => false,
    }
  }

  fn index(&self, name: &str) -> Option<usize> {
    let normalized = normalize_parameter_name(name);
    self.bindings.iter().find(|el| el.0 == normalized).map(|el| el.1)
  }
}

impl Debug for MemoryCall<'_> {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("MemoryCall")
      .field("connection", &self.connection)
      .field("program", &self.program)
      .finish()
  }
}

#[derive(Debug, Default)]
struct Counters {
  active: AtomicUsize,
  closed: AtomicUsize,
  executions: AtomicUsize,
  max_active: AtomicUsize,
  opened: AtomicUsize,
  schema_loads: AtomicUsize,
}

struct MemoryProgram {
  definition: ProgramDefinition,
  handler: Arc<Handler>,
}

#[derive(Default)]
struct State {
  counters: Counters,
  delay: RwLock<Option<Duration>>,
  generation: AtomicU64,
  hidden: RwLock<HashSet<(String, String)>>,
  max_result_sets: RwLock<Option<usize>>,
  programs: RwLock<HashMap<String, MemoryProgram>>,
  releases: Mutex<Vec<&'static str>>,
  unreachable: RwLock<HashSet<String>>,
}

/// In-memory [`Driver`]. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryDriver {
  state: Arc<State>,
}

impl MemoryDriver {
  /// Instance without programs.
  #[inline]
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of opened connections that weren't closed yet.
  #[inline]
  pub fn active(&self) -> usize {
    self.state.counters.active.load(Ordering::Relaxed)
  }

  /// Number of closed connections.
  #[inline]
  pub fn closed(&self) -> usize {
    self.state.counters.closed.load(Ordering::Relaxed)
  }

  /// Number of executed commands.
  #[inline]
  pub fn executions(&self) -> usize {
    self.state.counters.executions.load(Ordering::Relaxed)
  }

  /// Hides the definition of `program` from the connection identified by the normalized
  /// `connection` string.
  #[inline]
  pub fn hide_program(&self, connection: &str, program: &str) {
    let _ = self.state.hidden.write().insert((connection.into(), program.to_lowercase()));
    let _ = self.state.generation.fetch_add(1, Ordering::Relaxed);
  }

  /// Highest number of simultaneously opened connections.
  #[inline]
  pub fn max_active(&self) -> usize {
    self.state.counters.max_active.load(Ordering::Relaxed)
  }

  /// Number of opened connections.
  #[inline]
  pub fn opened(&self) -> usize {
    self.state.counters.opened.load(Ordering::Relaxed)
  }

  /// Registers or replaces a program.
  #[inline]
  pub fn register<F>(&self, definition: ProgramDefinition, handler: F)
  where
    F: Fn(&mut MemoryCall<'_>) -> crate::Result<MemoryResultSet> + Send + Sync + 'static,
  {
    let key = definition.name.to_lowercase();
    let program = MemoryProgram { definition, handler: Arc::new(handler) };
    let _ = self.state.programs.write().insert(key, program);
    let _ = self.state.generation.fetch_add(1, Ordering::Relaxed);
  }

  /// Kinds of the released resources, `"connection"` or `"cursor"`, in the order they were
  /// dropped.
  #[inline]
  pub fn releases(&self) -> Vec<&'static str> {
    self.state.releases.lock().clone()
  }

  /// Number of schema requests.
  #[inline]
  pub fn schema_loads(&self) -> usize {
    self.state.counters.schema_loads.load(Ordering::Relaxed)
  }

  /// Delays every subsequent execution.
  #[inline]
  pub fn set_delay(&self, delay: Option<Duration>) {
    *self.state.delay.write() = delay;
  }

  /// Limits the number of result sets returned by every subsequent execution, which simulates
  /// databases that stop answering a batch halfway.
  #[inline]
  pub fn set_max_result_sets(&self, max: Option<usize>) {
    *self.state.max_result_sets.write() = max;
  }

  /// Makes the connection identified by the normalized `connection` string reachable or not.
  #[inline]
  pub fn set_unreachable(&self, connection: &str, unreachable: bool) {
    let mut set = self.state.unreachable.write();
    if unreachable {
      let _ = set.insert(connection.into());
    } else {
      let _ = set.remove(connection);
    }
  }

  fn check_reachability(&self, connection: &Connection) -> crate::Result<()> {
    if self.state.unreachable.read().contains(connection.normalized()) {
      return Err(Error::driver(MemoryError::Unreachable(connection.normalized().into())));
    }
    Ok(())
  }
}

impl Debug for MemoryDriver {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("MemoryDriver").field("counters", &self.state.counters).finish()
  }
}

impl Driver for MemoryDriver {
  type Connection = MemoryConnection;

  #[inline]
  async fn load_schema(
    &self,
    connection: &Connection,
    _force_reload: bool,
  ) -> crate::Result<Arc<DatabaseSchema>> {
    let _ = self.state.counters.schema_loads.fetch_add(1, Ordering::Relaxed);
    self.check_reachability(connection)?;
    let hidden = self.state.hidden.read();
    let normalized = String::from(connection.normalized());
    let definitions: Vec<_> = self
      .state
      .programs
      .read()
      .iter()
      .filter(|(key, _)| !hidden.contains(&(normalized.clone(), (*key).clone())))
      .map(|(_, program)| program.definition.clone())
      .collect();
    let generation = self.state.generation.load(Ordering::Relaxed);
    Ok(Arc::new(DatabaseSchema::new(generation, definitions)))
  }

  #[inline]
  async fn open(&self, connection: &Connection) -> crate::Result<Self::Connection> {
    self.check_reachability(connection)?;
    let counters = &self.state.counters;
    let _ = counters.opened.fetch_add(1, Ordering::Relaxed);
    let active = counters.active.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    let _ = counters.max_active.fetch_max(active, Ordering::Relaxed);
    let normalized = connection.normalized().into();
    Ok(MemoryConnection { normalized, state: Arc::clone(&self.state) })
  }
}

/// Connection of [`MemoryDriver`].
pub struct MemoryConnection {
  normalized: String,
  state: Arc<State>,
}

impl MemoryConnection {
  fn call(
    &self,
    program: &str,
    bindings: Vec<(String, usize)>,
    parameters: &mut [DbParameter],
  ) -> crate::Result<MemoryResultSet> {
    let handler = match self.state.programs.read().get(&program.to_lowercase()) {
      Some(elem) => Arc::clone(&elem.handler),
      None => return Err(Error::driver(MemoryError::UnknownProgram(program.into()))),
    };
    let mut call = MemoryCall { bindings, connection: &self.normalized, parameters, program };
    handler(&mut call)
  }
}

impl Debug for MemoryConnection {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("MemoryConnection").field("normalized", &self.normalized).finish()
  }
}

impl Drop for MemoryConnection {
  #[inline]
  fn drop(&mut self) {
    let _ = self.state.counters.active.fetch_sub(1, Ordering::Relaxed);
    let _ = self.state.counters.closed.fetch_add(1, Ordering::Relaxed);
    self.state.releases.lock().push("connection");
  }
}

impl DriverConnection for MemoryConnection {
  type Cursor = MemoryCursor;

  #[inline]
  async fn execute(&mut self, command: &mut DbCommand) -> crate::Result<Self::Cursor> {
    let delay = *self.state.delay.read();
    if let Some(elem) = delay {
      tokio::time::sleep(elem).await;
    }
    let _ = self.state.counters.executions.fetch_add(1, Ordering::Relaxed);
    let mut sets = VecDeque::new();
    match &command.kind {
      CommandKind::Batch(statements) => {
        for statement in statements {
          let bindings = statement
            .bindings
            .iter()
            .map(|el| (normalize_parameter_name(&el.name), el.index))
            .collect();
          sets.push_back(self.call(&statement.program, bindings, &mut command.parameters)?);
        }
      }
      CommandKind::Program(program) => {
        let bindings = command
          .parameters
          .iter()
          .enumerate()
          .map(|(idx, el)| (normalize_parameter_name(&el.name), idx))
          .collect();
        sets.push_back(self.call(program, bindings, &mut command.parameters)?);
      }
    }
    if let Some(max) = *self.state.max_result_sets.read() {
      sets.truncate(max);
    }
    let mut cursor = MemoryCursor {
      current: VecDeque::new(),
      records_affected: 0,
      remaining: sets,
      state: Arc::clone(&self.state),
    };
    cursor.advance();
    Ok(cursor)
  }
}

/// Cursor of [`MemoryConnection`].
pub struct MemoryCursor {
  current: VecDeque<Row>,
  records_affected: u64,
  remaining: VecDeque<MemoryResultSet>,
  state: Arc<State>,
}

impl MemoryCursor {
  fn advance(&mut self) -> bool {
    match self.remaining.pop_front() {
      Some(set) => {
        self.current = set.rows.into();
        self.records_affected = set.records_affected;
        true
      }
      None => {
        self.current.clear();
        self.records_affected = 0;
        false
      }
    }
  }
}

impl Debug for MemoryCursor {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("MemoryCursor")
      .field("current", &self.current)
      .field("records_affected", &self.records_affected)
      .field("remaining", &self.remaining.len())
      .finish()
  }
}

impl Drop for MemoryCursor {
  #[inline]
  fn drop(&mut self) {
    self.state.releases.lock().push("cursor");
  }
}

impl Cursor for MemoryCursor {
  #[inline]
  async fn next_row(&mut self) -> crate::Result<Option<Row>> {
    Ok(self.current.pop_front())
  }

  #[inline]
  async fn next_result(&mut self) -> crate::Result<bool> {
    Ok(self.advance())
  }

  #[inline]
  fn records_affected(&self) -> u64 {
    self.records_affected
  }
}
