//! Request-body checks applied before anything touches the store.

use serde_json::Value;
use thiserror::Error;

use crate::model::{CustomFieldInput, FieldType, OwnerInput, TaskInput};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Task name is required")]
    TaskNameRequired,
    #[error("Owner ID is required")]
    OwnerIdRequired,
    #[error("Completion percentage must be between 0 and 100")]
    CompletionOutOfRange(i64),
    #[error("Owner name is required")]
    OwnerNameRequired,
    #[error("Valid email is required")]
    EmailInvalid,
    #[error("Field name is required")]
    FieldNameRequired,
    #[error("Valid field type is required")]
    FieldTypeInvalid,
    #[error("Options array is required for select/multiselect fields")]
    OptionsRequired,
}

fn blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Applied to both create and full update: a task always needs a name
/// and an owner.
pub fn validate_task(input: &TaskInput) -> Result<(), ValidationError> {
    if blank(input.name.as_deref()) {
        return Err(ValidationError::TaskNameRequired);
    }
    if input.owner_id.is_none() {
        return Err(ValidationError::OwnerIdRequired);
    }
    if let Some(pct) = input.completion_percentage {
        if !(0..=100).contains(&pct) {
            return Err(ValidationError::CompletionOutOfRange(pct));
        }
    }
    Ok(())
}

pub fn validate_owner(input: &OwnerInput) -> Result<(), ValidationError> {
    if blank(input.name.as_deref()) {
        return Err(ValidationError::OwnerNameRequired);
    }
    match input.email.as_deref() {
        Some(email) if email.contains('@') => Ok(()),
        _ => Err(ValidationError::EmailInvalid),
    }
}

/// Returns the parsed field type and, for select kinds, the option list.
pub fn validate_custom_field(
    input: &CustomFieldInput,
) -> Result<(FieldType, Option<Vec<Value>>), ValidationError> {
    if blank(input.name.as_deref()) {
        return Err(ValidationError::FieldNameRequired);
    }
    let field_type = input
        .field_type
        .as_deref()
        .and_then(FieldType::parse)
        .ok_or(ValidationError::FieldTypeInvalid)?;

    let options = match &input.options {
        Some(Value::Array(items)) => Some(items.clone()),
        _ => None,
    };
    if field_type.needs_options() && options.as_ref().map_or(true, Vec::is_empty) {
        return Err(ValidationError::OptionsRequired);
    }
    Ok((field_type, options))
}
