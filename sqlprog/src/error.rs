use crate::{
  batch::BatchError, executor::ExecutionError, program::ProgramError, reader::ReaderError,
  sync::SemaphoreError, value::TypeError,
};
use core::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Grouped individual errors
///
/// Instances are cheap to clone so that cached validation failures can be replayed and the
/// outcome of a shared batch execution can be observed by every caller.
#[derive(Clone, Debug)]
pub enum Error {
  // External
  //
  /// Failure reported by a database driver.
  Driver(Arc<dyn core::error::Error + Send + Sync>),

  // Generic
  //
  /// Several independent failures, for example, one per connection of a load-balanced set.
  Aggregate(Vec<Error>),
  /// Weights must be finite and non-negative.
  InvalidWeight,
  /// A set of arithmetic operations resulted in an overflow, underflow or division by zero
  OutOfBoundsArithmetic,
  /// Something went wrong while a program was being executed.
  ProgramExecution {
    /// Name of the failing program or programs.
    program: String,
    /// Original cause.
    cause: Box<Error>,
  },

  // Internal
  //
  BatchError(BatchError),
  ExecutionError(ExecutionError),
  ProgramError(ProgramError),
  ReaderError(ReaderError),
  SemaphoreError(SemaphoreError),
  TypeError(TypeError),
}

impl Error {
  /// Wraps any error originated from a database driver.
  #[inline]
  pub fn driver<E>(error: E) -> Self
  where
    E: core::error::Error + Send + Sync + 'static,
  {
    Self::Driver(Arc::new(error))
  }

  /// Cancellations and timeouts of admissions, connections or commands.
  #[inline]
  pub fn is_interruption(&self) -> bool {
    matches!(
      self,
      Self::ExecutionError(ExecutionError::Cancelled | ExecutionError::TimedOut)
        | Self::SemaphoreError(SemaphoreError::Cancelled | SemaphoreError::TimedOut)
    )
  }

  /// Problems related to the topology or to the configuration rather than to a transient
  /// database fault.
  #[inline]
  pub fn is_topology(&self) -> bool {
    matches!(
      self,
      Self::BatchError(BatchError::NoCommonConnection)
        | Self::ExecutionError(
          ExecutionError::NoValidMapping { .. }
            | ExecutionError::UnknownLoadBalancedConnection { .. }
        )
    )
  }

  /// Original cause of a [`Error::ProgramExecution`] or the instance itself.
  #[inline]
  pub fn root_cause(&self) -> &Self {
    let mut this = self;
    while let Self::ProgramExecution { cause, .. } = this {
      this = cause;
    }
    this
  }

  pub(crate) fn wrap_execution(program: &str, error: Self) -> Self {
    if error.is_interruption()
      || error.is_topology()
      || matches!(error, Self::ProgramExecution { .. })
    {
      return error;
    }
    Self::ProgramExecution { program: program.into(), cause: Box::new(error) }
  }
}

impl Display for Error {
  #[inline]
  fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
    <Self as Debug>::fmt(self, f)
  }
}

impl core::error::Error for Error {
  #[inline]
  fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
    match self {
      Self::Driver(elem) => Some(&**elem),
      Self::ProgramExecution { cause, .. } => Some(&**cause),
      _ => None,
    }
  }
}

impl From<BatchError> for Error {
  #[inline]
  fn from(from: BatchError) -> Self {
    Self::BatchError(from)
  }
}

impl From<ExecutionError> for Error {
  #[inline]
  fn from(from: ExecutionError) -> Self {
    Self::ExecutionError(from)
  }
}

impl From<ProgramError> for Error {
  #[inline]
  fn from(from: ProgramError) -> Self {
    Self::ProgramError(from)
  }
}

impl From<ReaderError> for Error {
  #[inline]
  fn from(from: ReaderError) -> Self {
    Self::ReaderError(from)
  }
}

impl From<SemaphoreError> for Error {
  #[inline]
  fn from(from: SemaphoreError) -> Self {
    Self::SemaphoreError(from)
  }
}

impl From<TypeError> for Error {
  #[inline]
  fn from(from: TypeError) -> Self {
    Self::TypeError(from)
  }
}
