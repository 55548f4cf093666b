//! Description of the programs that a database exposes.
//!
//! Schemas are supplied by a [`crate::driver::Driver`] and consumed through
//! [`DatabaseSchema::program_definition`] and [`ProgramDefinition::validate_parameters`].

use crate::{
  parameter::{normalize_parameter_name, Direction},
  program::{ProgramError, ProgramParameter},
  value::SqlType,
};
use hashbrown::HashMap;

/// A parameter declared by a program of the database.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterDefinition {
  /// Direction
  pub direction: Direction,
  /// If the database provides a value when the parameter is omitted.
  pub has_default: bool,
  /// Declared name, including any prefix.
  pub name: String,
  /// Declared type
  pub ty: SqlType,
}

impl ParameterDefinition {
  /// Shortcut for a mandatory input parameter.
  #[inline]
  pub fn input(name: &str, ty: SqlType) -> Self {
    Self { direction: Direction::Input, has_default: false, name: name.into(), ty }
  }

  /// Shortcut for an output parameter.
  #[inline]
  pub fn output(name: &str, ty: SqlType) -> Self {
    Self { direction: Direction::Output, has_default: true, name: name.into(), ty }
  }

  /// Marks the parameter as optional.
  #[inline]
  #[must_use]
  pub fn with_default(mut self) -> Self {
    self.has_default = true;
    self
  }

  /// Changes the direction.
  #[inline]
  #[must_use]
  pub fn with_direction(mut self, direction: Direction) -> Self {
    self.direction = direction;
    self
  }
}

/// A stored procedure or function.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct ProgramDefinition {
  /// Name
  pub name: String,
  /// Declared parameters in ordinal order. A return value, if any, is not part of the
  /// ordinal sequence.
  pub parameters: Vec<ParameterDefinition>,
}

impl ProgramDefinition {
  /// Constructor
  #[inline]
  pub fn new(name: &str, parameters: Vec<ParameterDefinition>) -> Self {
    Self { name: name.into(), parameters }
  }

  /// Checks that the `requested` parameters are declared by this definition and returns
  /// their definitions in the requested order followed by the return value, if any.
  ///
  /// With `check_order`, the position of each requested parameter must match its ordinal.
  /// Mandatory inputs that weren't requested are reported as missing.
  #[inline]
  pub fn validate_parameters(
    &self,
    requested: &[ProgramParameter],
    check_order: bool,
  ) -> Result<Vec<ParameterDefinition>, ProgramError> {
    let ordinals: Vec<(usize, &ParameterDefinition, String)> = self
      .parameters
      .iter()
      .filter(|el| el.direction != Direction::ReturnValue)
      .enumerate()
      .map(|(idx, el)| (idx, el, normalize_parameter_name(&el.name)))
      .collect();
    let mut rslt = Vec::with_capacity(requested.len().wrapping_add(1));
    let mut used = vec![false; ordinals.len()];
    for (idx, parameter) in requested.iter().enumerate() {
      let normalized = normalize_parameter_name(&parameter.name);
      let Some((ordinal, definition, _)) = ordinals.iter().find(|el| el.2 == normalized) else {
        return Err(ProgramError::UnknownParameter {
          parameter: parameter.name.clone(),
          program: self.name.clone(),
        });
      };
      if check_order && *ordinal != idx {
        return Err(ProgramError::ParameterOrderMismatch {
          expected: *ordinal,
          parameter: parameter.name.clone(),
          program: self.name.clone(),
          received: idx,
        });
      }
      if let Some(ty) = parameter.ty.filter(|el| !el.same_kind(definition.ty)) {
        return Err(ProgramError::ParameterTypeMismatch {
          expected: definition.ty,
          parameter: parameter.name.clone(),
          program: self.name.clone(),
          received: ty,
        });
      }
      if let Some(elem) = used.get_mut(*ordinal) {
        *elem = true;
      }
      rslt.push((*definition).clone());
    }
    for ((_, definition, _), was_used) in ordinals.iter().zip(&used) {
      let is_mandatory =
        !definition.has_default && !matches!(definition.direction, Direction::Output);
      if is_mandatory && !was_used {
        return Err(ProgramError::MissingParameter {
          parameter: definition.name.clone(),
          program: self.name.clone(),
        });
      }
    }
    let return_values = self.parameters.iter().filter(|el| el.direction == Direction::ReturnValue);
    rslt.extend(return_values.cloned());
    Ok(rslt)
  }
}

/// Programs exposed by the database behind a connection.
#[derive(Clone, Debug, Default)]
pub struct DatabaseSchema {
  definitions: HashMap<String, ProgramDefinition>,
  generation: u64,
}

impl DatabaseSchema {
  /// Creates a new instance. `generation` must change whenever the contents change.
  #[inline]
  pub fn new(generation: u64, definitions: impl IntoIterator<Item = ProgramDefinition>) -> Self {
    Self {
      definitions: definitions.into_iter().map(|el| (el.name.to_lowercase(), el)).collect(),
      generation,
    }
  }

  /// Identifies the version of this schema. Mappings built from the same generation can be
  /// reused.
  #[inline]
  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Case-insensitive lookup
  #[inline]
  pub fn program_definition(&self, name: &str) -> Option<&ProgramDefinition> {
    self.definitions.get(&name.to_lowercase())
  }

  /// All definitions
  #[inline]
  pub fn program_definitions(&self) -> impl Iterator<Item = &ProgramDefinition> {
    self.definitions.values()
  }
}
