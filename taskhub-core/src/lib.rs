//! Task, owner and custom-field records with an in-memory store.

pub mod model;
pub mod store;
pub mod validation;

pub use model::{
    CustomField, CustomFieldInput, FieldType, Owner, OwnerInput, Task, TaskInput, TaskView,
};
pub use store::{StoreError, TaskStore};
pub use validation::{validate_custom_field, validate_owner, validate_task, ValidationError};
