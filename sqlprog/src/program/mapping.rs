use crate::{
  driver::DbParameter,
  parameter::{normalize_parameter_name, Direction, ErasedOutput, ParameterKind, ParameterSet},
  program::{ProgramError, ProgramParameter},
  schema::{DatabaseSchema, ParameterDefinition},
  topology::Connection,
  value::{SqlValue, TypeConstraintMode},
};
use std::sync::Arc;

/// Physical parameters of an invocation plus the information required to deliver outputs.
#[derive(Debug, Default)]
pub struct BoundParameters {
  pub(crate) chained: Vec<(usize, u64)>,
  pub(crate) outputs: Vec<(usize, Arc<dyn ErasedOutput>)>,
  pub(crate) parameters: Vec<DbParameter>,
}

impl BoundParameters {
  /// Physical parameters in declaration order.
  #[inline]
  pub fn parameters(&self) -> &[DbParameter] {
    &self.parameters
  }
}

/// The pairing of a program with the definition found in one physical connection.
#[derive(Debug)]
pub struct ProgramMapping {
  checked_order: bool,
  connection: Arc<Connection>,
  parameters: Vec<ParameterDefinition>,
  program: String,
  schema_generation: u64,
}

impl ProgramMapping {
  pub(crate) fn new(
    program: &str,
    connection: &Arc<Connection>,
    schema: &DatabaseSchema,
    requested: &[ProgramParameter],
    check_order: bool,
  ) -> Result<Self, ProgramError> {
    let Some(definition) = schema.program_definition(program) else {
      return Err(ProgramError::DefinitionNotFound { program: program.into() });
    };
    let parameters = definition.validate_parameters(requested, check_order)?;
    Ok(Self {
      checked_order: check_order,
      connection: Arc::clone(connection),
      parameters,
      program: definition.name.clone(),
      schema_generation: schema.generation(),
    })
  }

  /// Converts caller values into physical parameters.
  ///
  /// Inputs that weren't supplied are omitted so that the database applies its defaults while
  /// outputs are always present. Names unknown to the definition are rejected.
  #[inline]
  pub fn bind(
    &self,
    values: &ParameterSet,
    mode: TypeConstraintMode,
  ) -> crate::Result<BoundParameters> {
    for entry in values.entries() {
      if !self.parameters.iter().any(|el| normalize_parameter_name(&el.name) == entry.normalized) {
        return Err(
          ProgramError::UnknownParameter {
            parameter: entry.name.clone(),
            program: self.program.clone(),
          }
          .into(),
        );
      }
    }
    let mut rslt = BoundParameters {
      chained: Vec::new(),
      outputs: Vec::new(),
      parameters: Vec::with_capacity(self.parameters.len()),
    };
    for definition in &self.parameters {
      let normalized = normalize_parameter_name(&definition.name);
      let entry = values.entries().iter().find(|el| el.normalized == normalized);
      let idx = rslt.parameters.len();
      let value = match entry.map(|el| &el.kind) {
        None if definition.direction.is_output() => SqlValue::Null,
        None => continue,
        Some(ParameterKind::Input(value)) => {
          definition.ty.coerce(&definition.name, value.clone(), mode)?
        }
        Some(ParameterKind::InputFrom(id)) => {
          rslt.chained.push((idx, *id));
          SqlValue::Null
        }
        Some(ParameterKind::InputOutput(value, slot)) => {
          rslt.outputs.push((idx, Arc::clone(slot)));
          definition.ty.coerce(&definition.name, value.clone(), mode)?
        }
        Some(ParameterKind::Output(slot)) => {
          rslt.outputs.push((idx, Arc::clone(slot)));
          SqlValue::Null
        }
      };
      let direction = match entry.map(|el| &el.kind) {
        Some(ParameterKind::InputOutput(..)) if definition.direction == Direction::Output => {
          Direction::InputOutput
        }
        _ => definition.direction,
      };
      rslt.parameters.push(DbParameter {
        direction,
        name: definition.name.clone(),
        ty: definition.ty,
        value,
      });
    }
    Ok(rslt)
  }

  /// If parameter positions were checked.
  #[inline]
  pub fn checked_order(&self) -> bool {
    self.checked_order
  }

  /// Physical connection
  #[inline]
  pub fn connection(&self) -> &Arc<Connection> {
    &self.connection
  }

  /// Resolved parameters followed by the return value, if any.
  #[inline]
  pub fn parameters(&self) -> &[ParameterDefinition] {
    &self.parameters
  }

  /// Name of the program as declared by the database.
  #[inline]
  pub fn program(&self) -> &str {
    &self.program
  }

  /// Generation of the schema this mapping was built from.
  #[inline]
  pub fn schema_generation(&self) -> u64 {
    self.schema_generation
  }
}
