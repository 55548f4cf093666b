use crate::{
  driver::Cursor,
  value::{FromSqlValue, Row, SqlValue},
};
use core::{future::Future, marker::PhantomData};

/// Selects what an execution returns.
///
/// Shapes only consume the current result set of a cursor, which allows batches to consume one
/// set per command.
pub trait ResultShape: Send {
  /// Returned element
  type Output: Send + 'static;

  /// Extracts [`Self::Output`] from the current result set of `cursor`.
  fn consume<C>(self, cursor: &mut C) -> impl Future<Output = crate::Result<Self::Output>> + Send
  where
    C: Cursor;
}

/// First value of the first row. `None` if there are no rows.
pub struct Scalar<T>(PhantomData<fn() -> T>);

impl<T> Scalar<T> {
  /// Constructor
  #[inline]
  pub const fn new() -> Self {
    Self(PhantomData)
  }
}

impl<T> Clone for Scalar<T> {
  #[inline]
  fn clone(&self) -> Self {
    *self
  }
}

impl<T> Copy for Scalar<T> {}

impl<T> core::fmt::Debug for Scalar<T> {
  #[inline]
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.write_str("Scalar")
  }
}

impl<T> Default for Scalar<T> {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

impl<T> ResultShape for Scalar<T>
where
  T: FromSqlValue + Send + 'static,
{
  type Output = Option<T>;

  #[inline]
  async fn consume<C>(self, cursor: &mut C) -> crate::Result<Self::Output>
  where
    C: Cursor,
  {
    match cursor.next_row().await? {
      Some(row) => Ok(row.decode(0)?),
      None => Ok(None),
    }
  }
}

/// Number of modified records.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonQuery;

impl ResultShape for NonQuery {
  type Output = u64;

  #[inline]
  async fn consume<C>(self, cursor: &mut C) -> crate::Result<Self::Output>
  where
    C: Cursor,
  {
    Ok(cursor.records_affected())
  }
}

/// Every row
#[derive(Clone, Copy, Debug, Default)]
pub struct Rows;

impl ResultShape for Rows {
  type Output = Vec<Row>;

  #[inline]
  async fn consume<C>(self, cursor: &mut C) -> crate::Result<Self::Output>
  where
    C: Cursor,
  {
    let mut rslt = Vec::new();
    while let Some(row) = cursor.next_row().await? {
      rslt.push(row);
    }
    Ok(rslt)
  }
}

/// XML document split across the first column of every row. `None` if there are no rows.
#[derive(Clone, Copy, Debug, Default)]
pub struct Xml;

impl ResultShape for Xml {
  type Output = Option<String>;

  #[inline]
  async fn consume<C>(self, cursor: &mut C) -> crate::Result<Self::Output>
  where
    C: Cursor,
  {
    let mut rslt: Option<String> = None;
    while let Some(row) = cursor.next_row().await? {
      let chunk = match row.get(0) {
        None | Some(SqlValue::Null) => continue,
        Some(elem) => String::from_sql_value(elem)?,
      };
      rslt.get_or_insert_with(String::new).push_str(&chunk);
    }
    Ok(rslt)
  }
}

/// Calls a function for every row and returns the number of visited rows.
#[derive(Clone, Copy, Debug)]
pub struct ForEachRow<F>(pub F);

impl<F> ResultShape for ForEachRow<F>
where
  F: FnMut(&Row) -> crate::Result<()> + Send,
{
  type Output = u64;

  #[inline]
  async fn consume<C>(mut self, cursor: &mut C) -> crate::Result<Self::Output>
  where
    C: Cursor,
  {
    let mut rslt: u64 = 0;
    while let Some(row) = cursor.next_row().await? {
      (self.0)(&row)?;
      rslt = rslt.wrapping_add(1);
    }
    Ok(rslt)
  }
}
