//! Values exchanged with the database and the types that describe them.

use core::fmt::{Display, Formatter};
use rust_decimal::{Decimal, RoundingStrategy};

/// Errors related to values and types.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TypeError {
  /// The value of a parameter isn't compatible with the declared type.
  IncompatibleValue {
    /// Parameter name
    parameter: String,
    /// Declared type
    ty: SqlType,
    /// Type of the provided value
    value: &'static str,
  },
  /// A database value couldn't be converted into the requested Rust type.
  InvalidCast {
    /// Type of the database value
    from: &'static str,
    /// Requested Rust type
    to: &'static str,
  },
  /// An integer doesn't fit into the declared type.
  Overflow {
    /// Parameter name
    parameter: String,
    /// Declared type
    ty: SqlType,
  },
  /// A floating point number loses precision when stored into the declared type.
  PrecisionLoss {
    /// Parameter name
    parameter: String,
  },
  /// A decimal has more fractional digits than the declared scale.
  ScaleLoss {
    /// Parameter name
    parameter: String,
    /// Received scale
    scale: u32,
    /// Declared scale
    max: u32,
  },
  /// A string or a byte sequence is longer than the declared size.
  Truncation {
    /// Parameter name
    parameter: String,
    /// Received length
    len: usize,
    /// Declared maximum length
    max: usize,
  },
}

/// What happens when a value doesn't fit into the declared size or precision of a parameter.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum TypeConstraintMode {
  /// Values are adjusted and a warning is logged.
  #[default]
  Warn,
  /// Values are adjusted silently.
  Silent,
  /// Nothing is adjusted and an error is returned instead.
  Error,
}

/// Physical type of a parameter or column.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SqlType {
  /// 64-bit integer
  BigInt,
  /// Boolean
  Bit,
  /// Fixed-point number with `precision` digits, `scale` of them after the decimal point.
  Decimal {
    /// Total number of digits
    precision: u8,
    /// Number of fractional digits
    scale: u8,
  },
  /// 64-bit floating point number
  Float,
  /// 32-bit integer
  Int,
  /// Variable-length unicode string. `None` means unlimited.
  NVarChar(Option<usize>),
  /// 32-bit floating point number
  Real,
  /// Variable-length byte sequence. `None` means unlimited.
  VarBinary(Option<usize>),
  /// XML document
  Xml,
}

impl SqlType {
  /// If both types belong to the same family regardless of sizes.
  #[inline]
  pub fn same_kind(self, other: Self) -> bool {
    core::mem::discriminant(&self) == core::mem::discriminant(&other)
  }

  /// Converts `value` into a representation accepted by this type, applying `mode` when sizes
  /// or precisions are exceeded. `NULL` is accepted by every type.
  #[inline]
  pub fn coerce(
    self,
    parameter: &str,
    value: SqlValue,
    mode: TypeConstraintMode,
  ) -> Result<SqlValue, TypeError> {
    let incompatible = |value: &SqlValue| TypeError::IncompatibleValue {
      parameter: parameter.into(),
      ty: self,
      value: value.ty_name(),
    };
    let rslt = match (self, value) {
      (_, SqlValue::Null) => SqlValue::Null,
      (Self::BigInt, SqlValue::I32(elem)) => SqlValue::I64(elem.into()),
      (Self::BigInt, elem @ SqlValue::I64(_)) => elem,
      (Self::Bit, elem @ SqlValue::Bool(_)) => elem,
      (Self::Decimal { precision, scale }, SqlValue::Decimal(elem)) => {
        SqlValue::Decimal(fit_decimal(parameter, self, elem, precision, scale, mode)?)
      }
      (Self::Decimal { precision, scale }, SqlValue::I32(elem)) => {
        SqlValue::Decimal(fit_decimal(parameter, self, elem.into(), precision, scale, mode)?)
      }
      (Self::Decimal { precision, scale }, SqlValue::I64(elem)) => {
        SqlValue::Decimal(fit_decimal(parameter, self, elem.into(), precision, scale, mode)?)
      }
      (Self::Decimal { precision, scale }, SqlValue::F64(elem)) => {
        let Ok(local) = Decimal::try_from(elem) else {
          return Err(TypeError::Overflow { parameter: parameter.into(), ty: self });
        };
        SqlValue::Decimal(fit_decimal(parameter, self, local, precision, scale, mode)?)
      }
      (Self::Float, SqlValue::I32(elem)) => SqlValue::F64(elem.into()),
      (Self::Float, elem @ SqlValue::F64(_)) => elem,
      #[allow(clippy::cast_precision_loss, reason = "values are stored as floats")]
      (Self::Float, SqlValue::I64(elem)) => SqlValue::F64(elem as f64),
      (Self::Int, elem @ SqlValue::I32(_)) => elem,
      (Self::Int, SqlValue::I64(elem)) => match i32::try_from(elem) {
        Ok(local) => SqlValue::I32(local),
        Err(_) => return Err(TypeError::Overflow { parameter: parameter.into(), ty: self }),
      },
      (Self::NVarChar(max), SqlValue::Text(elem)) => {
        SqlValue::Text(truncate_text(parameter, elem, max, mode)?)
      }
      (Self::NVarChar(max), SqlValue::Xml(elem)) => {
        SqlValue::Text(truncate_text(parameter, elem, max, mode)?)
      }
      (Self::Real, SqlValue::I32(elem)) => SqlValue::F64(elem.into()),
      (Self::Real, SqlValue::F64(elem)) => {
        #[allow(clippy::cast_possible_truncation, reason = "precision loss is checked")]
        let narrowed = f64::from(elem as f32);
        if narrowed.to_bits() != elem.to_bits() && !elem.is_nan() {
          match mode {
            TypeConstraintMode::Error => {
              return Err(TypeError::PrecisionLoss { parameter: parameter.into() });
            }
            TypeConstraintMode::Silent => {}
            TypeConstraintMode::Warn => {
              _warn!(parameter, value = elem, stored = narrowed, "Precision loss");
            }
          }
        }
        SqlValue::F64(narrowed)
      }
      (Self::VarBinary(max), SqlValue::Bytes(mut elem)) => {
        if let Some(local_max) = max.filter(|local| elem.len() > *local) {
          constraint_violation(parameter, elem.len(), local_max, mode)?;
          elem.truncate(local_max);
        }
        SqlValue::Bytes(elem)
      }
      (Self::Xml, elem @ SqlValue::Xml(_)) => elem,
      (Self::Xml, SqlValue::Text(elem)) => SqlValue::Xml(elem),
      (_, elem) => return Err(incompatible(&elem)),
    };
    Ok(rslt)
  }
}

impl Display for SqlType {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    match self {
      Self::BigInt => f.write_str("bigint"),
      Self::Bit => f.write_str("bit"),
      Self::Decimal { precision, scale } => write!(f, "decimal({precision}, {scale})"),
      Self::Float => f.write_str("float"),
      Self::Int => f.write_str("int"),
      Self::NVarChar(None) => f.write_str("nvarchar(max)"),
      Self::NVarChar(Some(len)) => write!(f, "nvarchar({len})"),
      Self::Real => f.write_str("real"),
      Self::VarBinary(None) => f.write_str("varbinary(max)"),
      Self::VarBinary(Some(len)) => write!(f, "varbinary({len})"),
      Self::Xml => f.write_str("xml"),
    }
  }
}

/// A value received from or sent to the database.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum SqlValue {
  /// Boolean
  Bool(bool),
  /// Byte sequence
  Bytes(Vec<u8>),
  /// Fixed-point number
  Decimal(Decimal),
  /// 64-bit floating point number
  F64(f64),
  /// 32-bit integer
  I32(i32),
  /// 64-bit integer
  I64(i64),
  /// Absence of value
  #[default]
  Null,
  /// Unicode string
  Text(String),
  /// XML document
  Xml(String),
}

impl SqlValue {
  /// If this instance is [`SqlValue::Null`].
  #[inline]
  pub fn is_null(&self) -> bool {
    matches!(self, Self::Null)
  }

  /// Textual contents of [`SqlValue::Text`] and [`SqlValue::Xml`].
  #[inline]
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::Text(elem) | Self::Xml(elem) => Some(elem),
      _ => None,
    }
  }

  /// Human-readable name of the variant.
  #[inline]
  pub fn ty_name(&self) -> &'static str {
    match self {
      Self::Bool(_) => "bool",
      Self::Bytes(_) => "bytes",
      Self::Decimal(_) => "decimal",
      Self::F64(_) => "f64",
      Self::I32(_) => "i32",
      Self::I64(_) => "i64",
      Self::Null => "null",
      Self::Text(_) => "text",
      Self::Xml(_) => "xml",
    }
  }
}

macro_rules! from_impls {
  ($($ty:ty => $variant:ident),* $(,)?) => {
    $(
      impl From<$ty> for SqlValue {
        #[inline]
        fn from(from: $ty) -> Self {
          Self::$variant(from.into())
        }
      }
    )*
  };
}

from_impls!(
  bool => Bool,
  Decimal => Decimal,
  f64 => F64,
  i32 => I32,
  i64 => I64,
  &str => Text,
  String => Text,
  Vec<u8> => Bytes,
  &[u8] => Bytes,
);

impl<T> From<Option<T>> for SqlValue
where
  T: Into<SqlValue>,
{
  #[inline]
  fn from(from: Option<T>) -> Self {
    from.map_or(Self::Null, Into::into)
  }
}

/// Conversion of database values into Rust types.
pub trait FromSqlValue: Sized {
  /// Performs the conversion.
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError>;
}

impl FromSqlValue for SqlValue {
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    Ok(value.clone())
  }
}

impl<T> FromSqlValue for Option<T>
where
  T: FromSqlValue,
{
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    if value.is_null() {
      return Ok(None);
    }
    T::from_sql_value(value).map(Some)
  }
}

impl FromSqlValue for bool {
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    match value {
      SqlValue::Bool(elem) => Ok(*elem),
      SqlValue::I32(elem) => Ok(*elem != 0),
      SqlValue::I64(elem) => Ok(*elem != 0),
      _ => Err(invalid_cast(value, "bool")),
    }
  }
}

impl FromSqlValue for Decimal {
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    match value {
      SqlValue::Decimal(elem) => Ok(*elem),
      SqlValue::I32(elem) => Ok((*elem).into()),
      SqlValue::I64(elem) => Ok((*elem).into()),
      _ => Err(invalid_cast(value, "Decimal")),
    }
  }
}

impl FromSqlValue for f64 {
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    match value {
      SqlValue::F64(elem) => Ok(*elem),
      SqlValue::I32(elem) => Ok((*elem).into()),
      _ => Err(invalid_cast(value, "f64")),
    }
  }
}

impl FromSqlValue for i32 {
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    match value {
      SqlValue::I32(elem) => Ok(*elem),
      SqlValue::I64(elem) => i32::try_from(*elem).map_err(|_err| invalid_cast(value, "i32")),
      _ => Err(invalid_cast(value, "i32")),
    }
  }
}

impl FromSqlValue for i64 {
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    match value {
      SqlValue::I32(elem) => Ok((*elem).into()),
      SqlValue::I64(elem) => Ok(*elem),
      _ => Err(invalid_cast(value, "i64")),
    }
  }
}

impl FromSqlValue for String {
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    value.as_str().map(Into::into).ok_or_else(|| invalid_cast(value, "String"))
  }
}

impl FromSqlValue for Vec<u8> {
  #[inline]
  fn from_sql_value(value: &SqlValue) -> Result<Self, TypeError> {
    match value {
      SqlValue::Bytes(elem) => Ok(elem.clone()),
      _ => Err(invalid_cast(value, "Vec<u8>")),
    }
  }
}

/// A sequence of values returned by a cursor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
  values: Vec<SqlValue>,
}

impl Row {
  /// Constructor
  #[inline]
  pub const fn new(values: Vec<SqlValue>) -> Self {
    Self { values }
  }

  /// Converts the value located at `idx`.
  #[inline]
  pub fn decode<T>(&self, idx: usize) -> crate::Result<Option<T>>
  where
    T: FromSqlValue,
  {
    match self.values.get(idx) {
      Some(elem) => Ok(Some(T::from_sql_value(elem)?)),
      None => Ok(None),
    }
  }

  /// Value located at `idx`.
  #[inline]
  pub fn get(&self, idx: usize) -> Option<&SqlValue> {
    self.values.get(idx)
  }

  /// If there are no values.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Number of values.
  #[inline]
  pub fn len(&self) -> usize {
    self.values.len()
  }

  /// All values
  #[inline]
  pub fn values(&self) -> &[SqlValue] {
    &self.values
  }
}

impl<T> From<Vec<T>> for Row
where
  T: Into<SqlValue>,
{
  #[inline]
  fn from(from: Vec<T>) -> Self {
    Self::new(from.into_iter().map(Into::into).collect())
  }
}

fn constraint_violation(
  parameter: &str,
  len: usize,
  max: usize,
  mode: TypeConstraintMode,
) -> Result<(), TypeError> {
  match mode {
    TypeConstraintMode::Error => {
      Err(TypeError::Truncation { parameter: parameter.into(), len, max })
    }
    TypeConstraintMode::Silent => Ok(()),
    TypeConstraintMode::Warn => {
      _warn!(parameter, len, max, "Value truncated");
      Ok(())
    }
  }
}

// Rounds fractional digits that exceed `scale` and rejects integral parts that don't fit into
// `precision - scale` digits regardless of `mode`.
fn fit_decimal(
  parameter: &str,
  ty: SqlType,
  value: Decimal,
  precision: u8,
  scale: u8,
  mode: TypeConstraintMode,
) -> Result<Decimal, TypeError> {
  let max = u32::from(scale);
  let rslt = if value.scale() > max {
    match mode {
      TypeConstraintMode::Error => {
        return Err(TypeError::ScaleLoss { parameter: parameter.into(), scale: value.scale(), max });
      }
      TypeConstraintMode::Silent => {}
      TypeConstraintMode::Warn => {
        _warn!(parameter, scale = value.scale(), max, "Decimal rounded");
      }
    }
    value.round_dp_with_strategy(max, RoundingStrategy::MidpointAwayFromZero)
  } else {
    value
  };
  let integral_digits = u32::from(precision.saturating_sub(scale));
  let bound = 10i128
    .checked_pow(integral_digits)
    .and_then(|el| Decimal::try_from_i128_with_scale(el, 0).ok());
  if let Some(local_bound) = bound {
    if rslt.trunc().abs() >= local_bound {
      return Err(TypeError::Overflow { parameter: parameter.into(), ty });
    }
  }
  Ok(rslt)
}

fn invalid_cast(value: &SqlValue, to: &'static str) -> TypeError {
  TypeError::InvalidCast { from: value.ty_name(), to }
}

fn truncate_text(
  parameter: &str,
  mut text: String,
  max: Option<usize>,
  mode: TypeConstraintMode,
) -> Result<String, TypeError> {
  let Some(local_max) = max else {
    return Ok(text);
  };
  let len = text.chars().count();
  if len > local_max {
    constraint_violation(parameter, len, local_max, mode)?;
    if let Some((byte_idx, _)) = text.char_indices().nth(local_max) {
      text.truncate(byte_idx);
    }
  }
  Ok(text)
}
