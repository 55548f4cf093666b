//! Parameters supplied by callers and their output slots.

use crate::{
  value::{FromSqlValue, SqlValue},
  Error,
};
use core::{
  fmt::{Debug, Formatter},
  marker::PhantomData,
  sync::atomic::{AtomicU64, Ordering},
};
use parking_lot::Mutex;
use std::sync::Arc;

static OUTPUT_ID: AtomicU64 = AtomicU64::new(1);

/// How a parameter exchanges data with the database.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
  /// Sent to the database
  Input,
  /// Sent to the database and modified by it
  InputOutput,
  /// Modified by the database
  Output,
  /// Return value of a program
  ReturnValue,
}

impl Direction {
  /// If the database writes into parameters that have this direction.
  #[inline]
  pub fn is_output(self) -> bool {
    matches!(self, Self::InputOutput | Self::Output | Self::ReturnValue)
  }
}

/// Canonical representation of a parameter name: case-insensitive and without the `@`
/// prefix.
#[inline]
pub fn normalize_parameter_name(name: &str) -> String {
  name.trim().trim_start_matches('@').to_lowercase()
}

pub(crate) trait ErasedOutput: Send + Sync {
  fn fail(&self, error: Error);

  fn id(&self) -> u64;

  fn set(&self, value: &SqlValue);
}

impl Debug for dyn ErasedOutput {
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_tuple("ErasedOutput").field(&self.id()).finish()
  }
}

struct OutputSlot<T> {
  id: u64,
  value: Mutex<Option<crate::Result<T>>>,
}

impl<T> ErasedOutput for OutputSlot<T>
where
  T: FromSqlValue + Send,
{
  fn fail(&self, error: Error) {
    *self.value.lock() = Some(Err(error));
  }

  fn id(&self) -> u64 {
    self.id
  }

  fn set(&self, value: &SqlValue) {
    *self.value.lock() = Some(T::from_sql_value(value).map_err(Error::from));
  }
}

/// Receives the value that the database wrote into an output parameter after the
/// corresponding execution finished.
///
/// Conversion failures are stored in the slot instead of aborting the execution, which
/// allows the delivery of other outputs and results.
pub struct Output<T> {
  slot: Arc<OutputSlot<T>>,
  _ty: PhantomData<fn() -> T>,
}

impl<T> Output<T>
where
  T: FromSqlValue + Send + 'static,
{
  fn new() -> Self {
    Self {
      slot: Arc::new(OutputSlot {
        id: OUTPUT_ID.fetch_add(1, Ordering::Relaxed),
        value: Mutex::new(None),
      }),
      _ty: PhantomData,
    }
  }

  fn erased(&self) -> Arc<dyn ErasedOutput> {
    Arc::clone(&self.slot) as Arc<dyn ErasedOutput>
  }

  /// Cloned value, if the execution already finished.
  #[inline]
  pub fn get(&self) -> Option<crate::Result<T>>
  where
    T: Clone,
  {
    self.slot.value.lock().clone()
  }

  /// If the database already wrote into this slot.
  #[inline]
  pub fn is_set(&self) -> bool {
    self.slot.value.lock().is_some()
  }

  /// Moves the value out, leaving the slot empty.
  #[inline]
  pub fn take(&self) -> Option<crate::Result<T>> {
    self.slot.value.lock().take()
  }
}

impl<T> Debug for Output<T> {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Output").field("id", &self.slot.id).finish()
  }
}

#[derive(Clone)]
pub(crate) enum ParameterKind {
  Input(SqlValue),
  InputFrom(u64),
  InputOutput(SqlValue, Arc<dyn ErasedOutput>),
  Output(Arc<dyn ErasedOutput>),
}

impl Debug for ParameterKind {
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    match self {
      Self::Input(value) => f.debug_tuple("Input").field(value).finish(),
      Self::InputFrom(id) => f.debug_tuple("InputFrom").field(id).finish(),
      Self::InputOutput(value, slot) => {
        f.debug_tuple("InputOutput").field(value).field(&slot.id()).finish()
      }
      Self::Output(slot) => f.debug_tuple("Output").field(&slot.id()).finish(),
    }
  }
}

#[derive(Clone, Debug)]
pub(crate) struct ParameterEntry {
  pub(crate) kind: ParameterKind,
  pub(crate) name: String,
  pub(crate) normalized: String,
}

/// Values and output slots of a single invocation.
///
/// ```rust
/// let mut parameters = sqlprog::parameter::ParameterSet::new();
/// let _ = parameters.input("@name", "John").input("@age", 30);
/// let id = parameters.output::<i64>("@id");
/// assert!(!id.is_set());
/// ```
#[derive(Clone, Debug, Default)]
pub struct ParameterSet {
  entries: Vec<ParameterEntry>,
}

impl ParameterSet {
  /// Empty instance
  #[inline]
  pub const fn new() -> Self {
    Self { entries: Vec::new() }
  }

  /// Adds or replaces an input value.
  #[inline]
  pub fn input(&mut self, name: &str, value: impl Into<SqlValue>) -> &mut Self {
    self.push(name, ParameterKind::Input(value.into()));
    self
  }

  /// Feeds the output of a previous command of the same batch into this parameter.
  #[inline]
  pub fn input_from<T>(&mut self, name: &str, output: &Output<T>) -> &mut Self {
    self.push(name, ParameterKind::InputFrom(output.slot.id));
    self
  }

  /// Adds a parameter that is sent to the database and whose modified value is received
  /// back.
  #[inline]
  pub fn input_output<T>(&mut self, name: &str, value: impl Into<SqlValue>) -> Output<T>
  where
    T: FromSqlValue + Send + 'static,
  {
    let output = Output::new();
    self.push(name, ParameterKind::InputOutput(value.into(), output.erased()));
    output
  }

  /// If there are no parameters.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Number of parameters.
  #[inline]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Adds a parameter whose value is only written by the database.
  #[inline]
  pub fn output<T>(&mut self, name: &str) -> Output<T>
  where
    T: FromSqlValue + Send + 'static,
  {
    let output = Output::new();
    self.push(name, ParameterKind::Output(output.erased()));
    output
  }

  /// Receives the return value of the program.
  #[inline]
  pub fn return_value<T>(&mut self) -> Output<T>
  where
    T: FromSqlValue + Send + 'static,
  {
    self.output(RETURN_VALUE)
  }

  pub(crate) fn entries(&self) -> &[ParameterEntry] {
    &self.entries
  }

  fn push(&mut self, name: &str, kind: ParameterKind) {
    let normalized = normalize_parameter_name(name);
    if let Some(elem) = self.entries.iter_mut().find(|el| el.normalized == normalized) {
      elem.kind = kind;
      return;
    }
    self.entries.push(ParameterEntry { kind, name: name.into(), normalized });
  }
}

/// Name used for the return value of programs.
pub const RETURN_VALUE: &str = "@RETURN_VALUE";
