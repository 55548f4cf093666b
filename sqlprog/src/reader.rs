//! Forward-only access to the rows returned by an execution.
//!
//! A reader goes from open to finished once every result set was consumed or from open to
//! closed when it is explicitly closed or torn down by a timeout. Finished readers behave as
//! if there was nothing left to read while closed readers reject every operation.

use crate::{
  driver::Cursor,
  misc::{until, DisposeOnce},
  value::{FromSqlValue, Row, SqlValue},
};
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Owner of the cursor of a reader. Whoever locks it can release the cursor, even while the
/// reader itself is held somewhere else.
pub type CursorSlot<C> = Mutex<DisposeOnce<C>>;

/// Errors of [`ForwardOnlyReader`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReaderError {
  /// An operation was attempted after the reader was closed.
  Closed {
    /// Name of the rejected operation
    operation: &'static str,
  },
}

/// See [`ForwardOnlyReader`].
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum ReaderState {
  /// Rows can be read.
  Open = 0,
  /// Every result set was consumed.
  Finished = 1,
  /// Released
  Closed = 2,
}

impl ReaderState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => Self::Open,
      1 => Self::Finished,
      _ => Self::Closed,
    }
  }
}

/// Shared state of a reader. Transitions only move forward.
#[derive(Debug, Default)]
pub struct ReaderStateCell(AtomicU8);

impl ReaderStateCell {
  /// Open instance
  #[inline]
  pub const fn new() -> Self {
    Self(AtomicU8::new(ReaderState::Open as u8))
  }

  /// Moves to `state` if it is after the current state. Returns `false` otherwise.
  #[inline]
  pub fn advance(&self, state: ReaderState) -> bool {
    let to = state as u8;
    self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |el| (to > el).then_some(to)).is_ok()
  }

  /// Current state
  #[inline]
  pub fn get(&self) -> ReaderState {
    ReaderState::from_u8(self.0.load(Ordering::Acquire))
  }
}

/// Reads rows of a [`Cursor`] one at a time.
#[derive(Debug)]
pub struct ForwardOnlyReader<C> {
  current: Option<Row>,
  cursor: Arc<CursorSlot<C>>,
  state: Arc<ReaderStateCell>,
  teardown: Option<CancellationToken>,
}

impl<C> ForwardOnlyReader<C>
where
  C: Cursor,
{
  /// Open reader positioned before the first row of the first result set.
  #[inline]
  pub fn new(cursor: C) -> Self {
    Self::with_state(cursor, Arc::new(ReaderStateCell::new()), None)
  }

  /// Like [`Self::new`] but the state can be closed from the outside. Firing `teardown`
  /// aborts pending operations.
  #[inline]
  pub fn with_state(
    cursor: C,
    state: Arc<ReaderStateCell>,
    teardown: Option<CancellationToken>,
  ) -> Self {
    let cursor = Arc::new(Mutex::new(DisposeOnce::new(cursor)));
    Self { current: None, cursor, state, teardown }
  }

  /// Releases the cursor. Subsequent operations fail with [`ReaderError::Closed`].
  #[inline]
  pub fn close(&mut self) {
    let _ = self.close_with(|| {});
  }

  /// Closes the reader and, unless the cursor is locked elsewhere, releases it and calls
  /// `then` before unlocking. Returns `false` if the cursor was locked elsewhere.
  pub(crate) fn close_with(&mut self, then: impl FnOnce()) -> bool {
    let _ = self.state.advance(ReaderState::Closed);
    self.current = None;
    let Ok(mut cursor) = self.cursor.try_lock() else {
      return false;
    };
    let _ = cursor.dispose();
    then();
    true
  }

  pub(crate) fn cursor_slot(&self) -> &Arc<CursorSlot<C>> {
    &self.cursor
  }

  /// Number of values of the current row. Zero if there is no current row.
  #[inline]
  pub fn field_count(&self) -> crate::Result<usize> {
    if !self.check("field_count")? {
      return Ok(0);
    }
    Ok(self.current.as_ref().map_or(0, Row::len))
  }

  /// Converts the value at `idx` of the current row.
  #[inline]
  pub fn get<T>(&self, idx: usize) -> crate::Result<Option<T>>
  where
    T: FromSqlValue,
  {
    if !self.check("get")? {
      return Ok(None);
    }
    match &self.current {
      Some(row) => row.decode(idx),
      None => Ok(None),
    }
  }

  /// Moves to the next result set. Returns `false` and finishes the reader if there are no
  /// more sets.
  #[inline]
  pub async fn next_result(&mut self) -> crate::Result<bool> {
    const OPERATION: &str = "next_result";
    if !self.check_mut(OPERATION)? {
      return Ok(false);
    }
    self.current = None;
    let rslt = {
      let mut cursor = self.cursor.lock().await;
      let Some(local) = cursor.get_mut() else {
        return Err(ReaderError::Closed { operation: OPERATION }.into());
      };
      until(local.next_result(), None, self.teardown.as_ref()).await
    };
    let has_more = match rslt {
      Ok(elem) => elem?,
      Err(_) => {
        self.close();
        return Err(ReaderError::Closed { operation: OPERATION }.into());
      }
    };
    if !has_more {
      let _ = self.state.advance(ReaderState::Finished);
    }
    Ok(has_more)
  }

  /// Moves to the next row of the current result set. Returns `false` if the set is
  /// exhausted.
  #[inline]
  pub async fn read(&mut self) -> crate::Result<bool> {
    const OPERATION: &str = "read";
    if !self.check_mut(OPERATION)? {
      return Ok(false);
    }
    let rslt = {
      let mut cursor = self.cursor.lock().await;
      let Some(local) = cursor.get_mut() else {
        return Err(ReaderError::Closed { operation: OPERATION }.into());
      };
      until(local.next_row(), None, self.teardown.as_ref()).await
    };
    let row = match rslt {
      Ok(elem) => elem?,
      Err(_) => {
        self.close();
        return Err(ReaderError::Closed { operation: OPERATION }.into());
      }
    };
    self.current = row;
    Ok(self.current.is_some())
  }

  /// Number of records modified by the current result set.
  #[inline]
  pub fn records_affected(&self) -> crate::Result<u64> {
    if !self.check("records_affected")? {
      return Ok(0);
    }
    let rslt = match self.cursor.try_lock() {
      Ok(cursor) => cursor.get().map_or(0, Cursor::records_affected),
      Err(_) => 0,
    };
    Ok(rslt)
  }

  /// The current row.
  #[inline]
  pub fn row(&self) -> crate::Result<Option<&Row>> {
    if !self.check("row")? {
      return Ok(None);
    }
    Ok(self.current.as_ref())
  }

  /// Current state
  #[inline]
  pub fn state(&self) -> ReaderState {
    self.state.get()
  }

  /// Value at `idx` of the current row.
  #[inline]
  pub fn value(&self, idx: usize) -> crate::Result<Option<&SqlValue>> {
    if !self.check("value")? {
      return Ok(None);
    }
    Ok(self.current.as_ref().and_then(|el| el.get(idx)))
  }

  // `true` if open, `false` if finished.
  fn check(&self, operation: &'static str) -> crate::Result<bool> {
    match self.state.get() {
      ReaderState::Open => Ok(true),
      ReaderState::Finished => Ok(false),
      ReaderState::Closed => Err(ReaderError::Closed { operation }.into()),
    }
  }

  fn check_mut(&mut self, operation: &'static str) -> crate::Result<bool> {
    let rslt = self.check(operation);
    if rslt.is_err() {
      self.close();
    }
    rslt
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    driver::Cursor,
    reader::{ForwardOnlyReader, ReaderError, ReaderState, ReaderStateCell},
    value::{Row, SqlValue},
    Error,
  };
  use std::{collections::VecDeque, sync::Arc};
  use tokio_util::sync::CancellationToken;

  struct VecCursor {
    current: VecDeque<Row>,
    sets: VecDeque<Vec<Row>>,
  }

  impl VecCursor {
    fn new(mut sets: VecDeque<Vec<Row>>) -> Self {
      let current = sets.pop_front().unwrap_or_default().into();
      Self { current, sets }
    }
  }

  impl Cursor for VecCursor {
    async fn next_row(&mut self) -> crate::Result<Option<Row>> {
      Ok(self.current.pop_front())
    }

    async fn next_result(&mut self) -> crate::Result<bool> {
      match self.sets.pop_front() {
        Some(set) => {
          self.current = set.into();
          Ok(true)
        }
        None => Ok(false),
      }
    }

    fn records_affected(&self) -> u64 {
      3
    }
  }

  fn reader() -> ForwardOnlyReader<VecCursor> {
    ForwardOnlyReader::new(VecCursor::new(
      [vec![Row::from(vec![1, 2]), Row::from(vec![3, 4])], vec![Row::from(vec!["a"])]].into(),
    ))
  }

  #[test]
  fn state_transitions_are_monotonic() {
    let cell = ReaderStateCell::new();
    assert!(cell.advance(ReaderState::Finished));
    assert!(!cell.advance(ReaderState::Open));
    assert!(!cell.advance(ReaderState::Finished));
    assert!(cell.advance(ReaderState::Closed));
    assert!(!cell.advance(ReaderState::Finished));
    assert_eq!(cell.get(), ReaderState::Closed);
  }

  #[tokio::test]
  async fn reads_every_result_set() {
    let mut reader = reader();
    let mut first = Vec::new();
    while reader.read().await.unwrap() {
      first.push(reader.get::<i32>(1).unwrap().unwrap());
    }
    assert_eq!(first, [2, 4]);
    assert!(reader.next_result().await.unwrap());
    assert!(reader.read().await.unwrap());
    assert_eq!(reader.value(0).unwrap(), Some(&SqlValue::Text("a".into())));
    assert_eq!(reader.field_count().unwrap(), 1);
    assert!(!reader.read().await.unwrap());
    assert!(!reader.next_result().await.unwrap());
    assert_eq!(reader.state(), ReaderState::Finished);
  }

  #[tokio::test]
  async fn finished_readers_return_empty_values() {
    let mut reader = reader();
    while reader.next_result().await.unwrap() {}
    assert!(!reader.read().await.unwrap());
    assert!(!reader.next_result().await.unwrap());
    assert_eq!(reader.field_count().unwrap(), 0);
    assert_eq!(reader.records_affected().unwrap(), 0);
    assert_eq!(reader.value(0).unwrap(), None);
  }

  #[tokio::test]
  async fn closed_readers_name_the_rejected_operation() {
    let mut reader = reader();
    assert!(reader.read().await.unwrap());
    reader.close();
    assert!(matches!(
      reader.read().await,
      Err(Error::ReaderError(ReaderError::Closed { operation: "read" }))
    ));
    assert!(matches!(
      reader.field_count(),
      Err(Error::ReaderError(ReaderError::Closed { operation: "field_count" }))
    ));
    assert!(matches!(
      reader.next_result().await,
      Err(Error::ReaderError(ReaderError::Closed { operation: "next_result" }))
    ));
    assert!(matches!(
      reader.value(0),
      Err(Error::ReaderError(ReaderError::Closed { operation: "value" }))
    ));
    reader.close();
    assert_eq!(reader.state(), ReaderState::Closed);
  }

  #[tokio::test]
  async fn external_teardown_closes_the_reader() {
    let state = Arc::new(ReaderStateCell::new());
    let token = CancellationToken::new();
    let mut reader = ForwardOnlyReader::with_state(
      VecCursor::new([vec![Row::from(vec![1])]].into()),
      Arc::clone(&state),
      Some(token.clone()),
    );
    let _ = state.advance(ReaderState::Closed);
    token.cancel();
    assert!(matches!(
      reader.records_affected(),
      Err(Error::ReaderError(ReaderError::Closed { operation: "records_affected" }))
    ));
    assert!(reader.read().await.is_err());
  }
}
