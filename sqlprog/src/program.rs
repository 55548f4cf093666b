//! Programs bound to load-balanced connections and the validation of their mappings.
//!
//! Every connection of the load-balanced set owns a cache slot that goes from unvalidated to
//! either valid or invalid. Slots are replaced as a whole under the validation lock and
//! execution only considers valid slots.

mod mapping;
#[cfg(test)]
mod tests;

use crate::{
  driver::Driver,
  topology::{Connection, LoadBalancedConnection},
  DbContext, Error,
};
use core::{
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};
pub use mapping::{BoundParameters, ProgramMapping};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::Instant;

pub use crate::value::TypeConstraintMode;

/// Errors found while programs are matched against database definitions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProgramError {
  /// The database doesn't expose a program with the given name.
  DefinitionNotFound {
    /// Program name
    program: String,
  },
  /// A mandatory parameter wasn't requested.
  MissingParameter {
    /// Parameter name
    parameter: String,
    /// Program name
    program: String,
  },
  /// The position of a parameter doesn't match the declared ordinal.
  ParameterOrderMismatch {
    /// Declared position
    expected: usize,
    /// Parameter name
    parameter: String,
    /// Program name
    program: String,
    /// Requested position
    received: usize,
  },
  /// The requested type is not of the same kind of the declared type.
  ParameterTypeMismatch {
    /// Declared type
    expected: crate::value::SqlType,
    /// Parameter name
    parameter: String,
    /// Program name
    program: String,
    /// Requested type
    received: crate::value::SqlType,
  },
  /// The program doesn't declare a parameter with the given name.
  UnknownParameter {
    /// Parameter name
    parameter: String,
    /// Program name
    program: String,
  },
}

/// Parameter of a program signature.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgramParameter {
  /// Name
  pub name: String,
  /// Expected type. `None` accepts whatever the database declares.
  pub ty: Option<crate::value::SqlType>,
}

impl ProgramParameter {
  /// Untyped parameter
  #[inline]
  pub fn new(name: &str) -> Self {
    Self { name: name.into(), ty: None }
  }

  /// Typed parameter
  #[inline]
  pub fn typed(name: &str, ty: crate::value::SqlType) -> Self {
    Self { name: name.into(), ty: Some(ty) }
  }
}

/// Knobs of a [`Program`].
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProgramOptions {
  /// If lazy validations must also check parameter positions.
  pub check_order: bool,
  /// What happens when values exceed declared sizes.
  pub constraint_mode: TypeConstraintMode,
  /// Timeout of commands created without an explicit one. `None` falls back to
  /// [`crate::config::ExecutorConfig::default_program_timeout`].
  pub default_timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub(crate) enum MappingState {
  Invalid(Error),
  Valid(Arc<ProgramMapping>),
}

#[derive(Clone, Debug)]
pub(crate) struct MappingEntry {
  pub(crate) issued: u64,
  #[allow(dead_code, reason = "only read by debug outputs")]
  pub(crate) loaded: Instant,
  pub(crate) state: MappingState,
}

/// A stored procedure or function attached to a load-balanced set of connections.
pub struct Program<D> {
  pub(crate) cache: RwLock<Vec<Option<MappingEntry>>>,
  pub(crate) connection: Arc<LoadBalancedConnection>,
  pub(crate) ctx: Arc<DbContext<D>>,
  issued: AtomicU64,
  pub(crate) name: String,
  pub(crate) options: ProgramOptions,
  parameters: Vec<ProgramParameter>,
  validation: tokio::sync::Mutex<()>,
}

impl<D> Program<D>
where
  D: Driver,
{
  /// Creates an unvalidated program. See [`DbContext::program`].
  #[inline]
  pub fn new(
    ctx: Arc<DbContext<D>>,
    connection: Arc<LoadBalancedConnection>,
    name: &str,
    parameters: Vec<ProgramParameter>,
    options: ProgramOptions,
  ) -> Self {
    let len = connection.connections().len();
    Self {
      cache: RwLock::new(vec![None; len]),
      connection,
      ctx,
      issued: AtomicU64::new(0),
      name: name.into(),
      options,
      parameters,
      validation: tokio::sync::Mutex::new(()),
    }
  }

  /// The load-balanced set this program was created with.
  #[inline]
  pub fn connection(&self) -> &Arc<LoadBalancedConnection> {
    &self.connection
  }

  /// Valid mappings, validating first if some connection was never validated.
  #[inline]
  pub async fn mappings(&self) -> crate::Result<Vec<Arc<ProgramMapping>>> {
    if self.cache.read().iter().any(Option::is_none) {
      self.validate(self.options.check_order, false, false).await?;
    }
    Ok(self.valid_mappings())
  }

  /// Name
  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Knobs
  #[inline]
  pub fn options(&self) -> &ProgramOptions {
    &self.options
  }

  /// Requested signature
  #[inline]
  pub fn parameters(&self) -> &[ProgramParameter] {
    &self.parameters
  }

  /// Matches the signature against the definitions found in every connection.
  ///
  /// Failures are cached and replayed by subsequent calls unless `force_schema_reload` is
  /// set. With `throw_on_error` a single failure is returned as is and several failures are
  /// returned as [`Error::Aggregate`], otherwise failures are only logged.
  #[inline]
  pub async fn validate(
    &self,
    check_order: bool,
    force_schema_reload: bool,
    throw_on_error: bool,
  ) -> crate::Result<()> {
    let issued = self.issued.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    self.validate_issued(issued, check_order, force_schema_reload, throw_on_error).await
  }

  /// Cached validation failures of the connections that couldn't be mapped.
  #[inline]
  pub fn validation_errors(&self) -> Vec<(Arc<Connection>, Error)> {
    let cache = self.cache.read();
    cache
      .iter()
      .zip(self.connection.connections())
      .filter_map(|(entry, connection)| match entry.as_ref().map(|el| &el.state) {
        Some(MappingState::Invalid(error)) => Some((Arc::clone(connection), error.clone())),
        _ => None,
      })
      .collect()
  }

  /// Valid mapping of the connection identified by the normalized connection string.
  pub(crate) fn mapping_for(&self, normalized: &str) -> Option<Arc<ProgramMapping>> {
    self.valid_mappings().into_iter().find(|el| el.connection().normalized() == normalized)
  }

  pub(crate) async fn validate_issued(
    &self,
    issued: u64,
    check_order: bool,
    force_schema_reload: bool,
    throw_on_error: bool,
  ) -> crate::Result<()> {
    let guard = self.validation.lock().await;
    let mut errors = Vec::new();
    for (idx, connection) in self.connection.connections().iter().enumerate() {
      let cached = self.cache.read().get(idx).cloned().flatten();
      let mut previous = None;
      if let Some(entry) = cached {
        match entry.state {
          MappingState::Invalid(error) if entry.issued >= issued || !force_schema_reload => {
            errors.push(error);
            continue;
          }
          MappingState::Valid(_) if entry.issued >= issued => continue,
          MappingState::Valid(mapping) => previous = Some(mapping),
          MappingState::Invalid(_) => {}
        }
      }
      let loaded = self.load_mapping(connection, previous, check_order, force_schema_reload).await;
      let state = match loaded {
        Ok(mapping) => MappingState::Valid(mapping),
        Err(error) => {
          errors.push(error.clone());
          MappingState::Invalid(error)
        }
      };
      if let Some(slot) = self.cache.write().get_mut(idx) {
        *slot = Some(MappingEntry { issued, loaded: Instant::now(), state });
      }
    }
    drop(guard);
    if throw_on_error {
      if errors.len() > 1 {
        return Err(Error::Aggregate(errors));
      }
      if let Some(error) = errors.pop() {
        return Err(error);
      }
    }
    for _error in &errors {
      _warn!(program = %self.name, error = %_error, "Validation failure");
    }
    Ok(())
  }

  pub(crate) fn valid_mappings(&self) -> Vec<Arc<ProgramMapping>> {
    self
      .cache
      .read()
      .iter()
      .filter_map(|entry| match entry.as_ref().map(|el| &el.state) {
        Some(MappingState::Valid(mapping)) => Some(Arc::clone(mapping)),
        _ => None,
      })
      .collect()
  }

  async fn load_mapping(
    &self,
    connection: &Arc<Connection>,
    previous: Option<Arc<ProgramMapping>>,
    check_order: bool,
    force_schema_reload: bool,
  ) -> crate::Result<Arc<ProgramMapping>> {
    let schema = self.ctx.driver().load_schema(connection, force_schema_reload).await?;
    let reusable = previous.filter(|el| {
      el.schema_generation() == schema.generation() && (el.checked_order() || !check_order)
    });
    if let Some(mapping) = reusable {
      return Ok(mapping);
    }
    let mapping =
      ProgramMapping::new(&self.name, connection, &schema, &self.parameters, check_order)?;
    Ok(Arc::new(mapping))
  }
}

impl<D> core::fmt::Debug for Program<D> {
  #[inline]
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Program")
      .field("connection", &self.connection.id())
      .field("name", &self.name)
      .field("options", &self.options)
      .finish()
  }
}
