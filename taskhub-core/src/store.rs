use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Map;
use thiserror::Error;

use crate::model::{CustomField, CustomFieldInput, Owner, OwnerInput, Task, TaskInput, TaskView};
use crate::validation::{validate_custom_field, validate_owner, validate_task, ValidationError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Task not found")]
    TaskNotFound(i64),
    #[error("Owner not found")]
    OwnerNotFound(i64),
    #[error("Custom field not found")]
    CustomFieldNotFound(i64),
    #[error("Owner {0} does not exist")]
    UnknownOwner(i64),
    #[error("Parent task {0} does not exist")]
    UnknownParent(i64),
    #[error("Task {0} cannot be nested under itself or one of its subtasks")]
    ParentCycle(i64),
    #[error("Email {0} is already in use")]
    DuplicateEmail(String),
}

#[derive(Default)]
struct Tables {
    owners: BTreeMap<i64, Owner>,
    tasks: BTreeMap<i64, Task>,
    custom_fields: BTreeMap<i64, CustomField>,
    next_owner: i64,
    next_task: i64,
    next_custom_field: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

impl Tables {
    fn check_owner(&self, owner_id: i64) -> Result<(), StoreError> {
        if self.owners.contains_key(&owner_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownOwner(owner_id))
        }
    }

    fn check_email_free(&self, email: &str, except: Option<i64>) -> Result<(), StoreError> {
        let taken = self
            .owners
            .values()
            .any(|o| Some(o.id) != except && o.email.eq_ignore_ascii_case(email));
        if taken {
            Err(StoreError::DuplicateEmail(email.to_string()))
        } else {
            Ok(())
        }
    }

    /// Parent must exist and, for an existing task, must not sit below it.
    fn check_parent(&self, task_id: Option<i64>, parent_id: i64) -> Result<(), StoreError> {
        if !self.tasks.contains_key(&parent_id) {
            return Err(StoreError::UnknownParent(parent_id));
        }
        let Some(task_id) = task_id else {
            return Ok(());
        };
        let mut cursor = Some(parent_id);
        while let Some(id) = cursor {
            if id == task_id {
                return Err(StoreError::ParentCycle(task_id));
            }
            cursor = self.tasks.get(&id).and_then(|t| t.parent_id);
        }
        Ok(())
    }

    fn view(&self, task: &Task) -> TaskView {
        TaskView {
            task: task.clone(),
            owner_name: self.owners.get(&task.owner_id).map(|o| o.name.clone()),
        }
    }
}

/// In-memory tables for owners, tasks and custom fields. Thread-safe.
#[derive(Default)]
pub struct TaskStore {
    tables: RwLock<Tables>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    // -- tasks --

    /// Newest first, with the owner's name joined in.
    pub fn list_tasks(&self) -> Vec<TaskView> {
        let tables = self.read();
        let mut tasks: Vec<&Task> = tables.tasks.values().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks.into_iter().map(|t| tables.view(t)).collect()
    }

    pub fn get_task(&self, id: i64) -> Result<Task, StoreError> {
        self.read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    pub fn subtasks(&self, parent_id: i64) -> Vec<Task> {
        self.read()
            .tasks
            .values()
            .filter(|t| t.parent_id == Some(parent_id))
            .cloned()
            .collect()
    }

    pub fn create_task(&self, input: TaskInput) -> Result<Task, StoreError> {
        self.create_task_at(input, Utc::now())
    }

    fn create_task_at(&self, input: TaskInput, now: DateTime<Utc>) -> Result<Task, StoreError> {
        validate_task(&input)?;
        let mut tables = self.write();

        let owner_id = input.owner_id.ok_or(ValidationError::OwnerIdRequired)?;
        tables.check_owner(owner_id)?;
        let parent_id = input.parent_id.flatten();
        if let Some(parent) = parent_id {
            tables.check_parent(None, parent)?;
        }

        let id = next_id(&mut tables.next_task);
        let task = Task {
            id,
            name: input.name.unwrap_or_default().trim().to_string(),
            description: input.description.flatten(),
            owner_id,
            start_date: input.start_date.unwrap_or(now),
            completion_percentage: input.completion_percentage.unwrap_or(0),
            parent_id,
            custom_fields: input.custom_fields.unwrap_or_else(Map::new),
            created_at: now,
            updated_at: now,
        };
        tables.tasks.insert(id, task.clone());
        debug!("Created task {} for owner {}", id, owner_id);
        Ok(task)
    }

    /// Writes only the fields present in `patch`.
    pub fn update_task(&self, id: i64, patch: TaskInput) -> Result<Task, StoreError> {
        validate_task(&patch)?;
        let mut tables = self.write();
        if !tables.tasks.contains_key(&id) {
            return Err(StoreError::TaskNotFound(id));
        }
        if let Some(owner_id) = patch.owner_id {
            tables.check_owner(owner_id)?;
        }
        if let Some(Some(parent)) = patch.parent_id {
            tables.check_parent(Some(id), parent)?;
        }

        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;
        if let Some(name) = patch.name {
            task.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(owner_id) = patch.owner_id {
            task.owner_id = owner_id;
        }
        if let Some(start_date) = patch.start_date {
            task.start_date = start_date;
        }
        if let Some(pct) = patch.completion_percentage {
            task.completion_percentage = pct;
        }
        if let Some(parent_id) = patch.parent_id {
            task.parent_id = parent_id;
        }
        if let Some(custom_fields) = patch.custom_fields {
            task.custom_fields = custom_fields;
        }
        task.updated_at = Utc::now().max(task.updated_at);
        debug!("Updated task {}", id);
        Ok(task.clone())
    }

    // -- owners --

    /// Sorted by name.
    pub fn list_owners(&self) -> Vec<Owner> {
        let mut owners: Vec<Owner> = self.read().owners.values().cloned().collect();
        owners.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        owners
    }

    pub fn create_owner(&self, input: OwnerInput) -> Result<Owner, StoreError> {
        validate_owner(&input)?;
        let mut tables = self.write();
        let email = input.email.unwrap_or_default().trim().to_string();
        tables.check_email_free(&email, None)?;

        let id = next_id(&mut tables.next_owner);
        let owner = Owner {
            id,
            name: input.name.unwrap_or_default().trim().to_string(),
            email,
        };
        tables.owners.insert(id, owner.clone());
        debug!("Created owner {}", id);
        Ok(owner)
    }

    pub fn update_owner(&self, id: i64, input: OwnerInput) -> Result<Owner, StoreError> {
        validate_owner(&input)?;
        let mut tables = self.write();
        if !tables.owners.contains_key(&id) {
            return Err(StoreError::OwnerNotFound(id));
        }
        let email = input.email.unwrap_or_default().trim().to_string();
        tables.check_email_free(&email, Some(id))?;

        let owner = tables
            .owners
            .get_mut(&id)
            .ok_or(StoreError::OwnerNotFound(id))?;
        owner.name = input.name.unwrap_or_default().trim().to_string();
        owner.email = email;
        Ok(owner.clone())
    }

    // -- custom fields --

    /// Sorted by name.
    pub fn list_custom_fields(&self) -> Vec<CustomField> {
        let mut fields: Vec<CustomField> = self.read().custom_fields.values().cloned().collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        fields
    }

    pub fn create_custom_field(&self, input: CustomFieldInput) -> Result<CustomField, StoreError> {
        let (field_type, options) = validate_custom_field(&input)?;
        let mut tables = self.write();
        let id = next_id(&mut tables.next_custom_field);
        let field = CustomField {
            id,
            name: input.name.unwrap_or_default().trim().to_string(),
            field_type,
            options,
            created_at: Utc::now(),
        };
        tables.custom_fields.insert(id, field.clone());
        debug!("Created custom field {} ({})", id, field_type.as_str());
        Ok(field)
    }

    pub fn update_custom_field(
        &self,
        id: i64,
        input: CustomFieldInput,
    ) -> Result<CustomField, StoreError> {
        let (field_type, options) = validate_custom_field(&input)?;
        let mut tables = self.write();
        let field = tables
            .custom_fields
            .get_mut(&id)
            .ok_or(StoreError::CustomFieldNotFound(id))?;
        field.name = input.name.unwrap_or_default().trim().to_string();
        field.field_type = field_type;
        field.options = options;
        Ok(field.clone())
    }

    pub fn delete_custom_field(&self, id: i64) -> Result<CustomField, StoreError> {
        let removed = self
            .write()
            .custom_fields
            .remove(&id)
            .ok_or(StoreError::CustomFieldNotFound(id))?;
        debug!("Deleted custom field {}", id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;
    use chrono::Duration;
    use serde_json::json;

    fn owner(store: &TaskStore, name: &str, email: &str) -> Owner {
        store
            .create_owner(OwnerInput {
                name: Some(name.into()),
                email: Some(email.into()),
            })
            .unwrap()
    }

    fn task_input(name: &str, owner_id: i64) -> TaskInput {
        TaskInput {
            name: Some(name.into()),
            owner_id: Some(owner_id),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_task_defaults() {
        let store = TaskStore::new();
        let ada = owner(&store, "Ada", "ada@example.com");
        let task = store.create_task(task_input("Plan", ada.id)).unwrap();

        assert_eq!(task.id, 1);
        assert_eq!(task.completion_percentage, 0);
        assert!(task.custom_fields.is_empty());
        assert_eq!(task.parent_id, None);
        assert_eq!(task.created_at, task.updated_at);
        assert_eq!(task.start_date, task.created_at);
    }

    #[test]
    fn test_create_task_rejects_unknown_owner() {
        let store = TaskStore::new();
        assert_eq!(
            store.create_task(task_input("Plan", 9)),
            Err(StoreError::UnknownOwner(9))
        );
        assert_eq!(
            store.create_task(TaskInput::default()),
            Err(StoreError::Validation(ValidationError::TaskNameRequired))
        );
    }

    #[test]
    fn test_list_tasks_newest_first_with_owner_name() {
        let store = TaskStore::new();
        let ada = owner(&store, "Ada", "ada@example.com");
        let t0 = Utc::now();
        store
            .create_task_at(task_input("older", ada.id), t0)
            .unwrap();
        store
            .create_task_at(task_input("newer", ada.id), t0 + Duration::seconds(5))
            .unwrap();

        let listed = store.list_tasks();
        assert_eq!(listed[0].task.name, "newer");
        assert_eq!(listed[1].task.name, "older");
        assert_eq!(listed[0].owner_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_update_task_patches_present_fields() {
        let store = TaskStore::new();
        let ada = owner(&store, "Ada", "ada@example.com");
        let mut input = task_input("Plan", ada.id);
        input.description = Some(Some("first draft".into()));
        input.custom_fields = Some(json!({"priority": "high"}).as_object().unwrap().clone());
        let created = store.create_task(input).unwrap();

        let mut patch = task_input("Plan v2", ada.id);
        patch.completion_percentage = Some(60);
        let updated = store.update_task(created.id, patch).unwrap();

        assert_eq!(updated.name, "Plan v2");
        assert_eq!(updated.completion_percentage, 60);
        assert_eq!(updated.description.as_deref(), Some("first draft"));
        assert_eq!(updated.custom_fields["priority"], "high");
        assert!(updated.updated_at >= created.updated_at);

        let mut clear = task_input("Plan v2", ada.id);
        clear.description = Some(None);
        assert_eq!(store.update_task(created.id, clear).unwrap().description, None);
    }

    #[test]
    fn test_update_missing_task() {
        let store = TaskStore::new();
        let ada = owner(&store, "Ada", "ada@example.com");
        assert_eq!(
            store.update_task(42, task_input("x", ada.id)),
            Err(StoreError::TaskNotFound(42))
        );
        assert_eq!(store.get_task(42), Err(StoreError::TaskNotFound(42)));
    }

    #[test]
    fn test_subtasks_and_parent_checks() {
        let store = TaskStore::new();
        let ada = owner(&store, "Ada", "ada@example.com");
        let root = store.create_task(task_input("root", ada.id)).unwrap();
        let mut child_input = task_input("child", ada.id);
        child_input.parent_id = Some(Some(root.id));
        let child = store.create_task(child_input).unwrap();
        store.create_task(task_input("unrelated", ada.id)).unwrap();

        let subtasks = store.subtasks(root.id);
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].id, child.id);

        let mut cycle = task_input("root", ada.id);
        cycle.parent_id = Some(Some(child.id));
        assert_eq!(
            store.update_task(root.id, cycle),
            Err(StoreError::ParentCycle(root.id))
        );

        let mut dangling = task_input("orphan", ada.id);
        dangling.parent_id = Some(Some(99));
        assert_eq!(store.create_task(dangling), Err(StoreError::UnknownParent(99)));
    }

    #[test]
    fn test_owner_email_unique() {
        let store = TaskStore::new();
        let ada = owner(&store, "Ada", "ada@example.com");
        let grace = owner(&store, "Grace", "grace@example.com");

        let dup = store.create_owner(OwnerInput {
            name: Some("Other".into()),
            email: Some("ADA@example.com".into()),
        });
        assert_eq!(dup, Err(StoreError::DuplicateEmail("ADA@example.com".into())));

        let steal = store.update_owner(
            grace.id,
            OwnerInput {
                name: Some("Grace".into()),
                email: Some("ada@example.com".into()),
            },
        );
        assert!(matches!(steal, Err(StoreError::DuplicateEmail(_))));

        let renamed = store
            .update_owner(
                ada.id,
                OwnerInput {
                    name: Some("Ada L.".into()),
                    email: Some("ada@example.com".into()),
                },
            )
            .unwrap();
        assert_eq!(renamed.name, "Ada L.");
    }

    #[test]
    fn test_owners_sorted_by_name() {
        let store = TaskStore::new();
        owner(&store, "Zed", "zed@example.com");
        owner(&store, "Ada", "ada@example.com");
        let names: Vec<String> = store.list_owners().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["Ada", "Zed"]);
    }

    #[test]
    fn test_custom_field_lifecycle() {
        let store = TaskStore::new();
        let field = store
            .create_custom_field(CustomFieldInput {
                name: Some("Priority".into()),
                field_type: Some("select".into()),
                options: Some(json!(["low", "high"])),
            })
            .unwrap();
        assert_eq!(field.field_type, FieldType::Select);

        let updated = store
            .update_custom_field(
                field.id,
                CustomFieldInput {
                    name: Some("Estimate".into()),
                    field_type: Some("number".into()),
                    options: None,
                },
            )
            .unwrap();
        assert_eq!(updated.field_type, FieldType::Number);
        assert_eq!(updated.options, None);

        assert_eq!(store.list_custom_fields().len(), 1);
        assert_eq!(store.delete_custom_field(field.id).unwrap().id, field.id);
        assert_eq!(
            store.delete_custom_field(field.id),
            Err(StoreError::CustomFieldNotFound(field.id))
        );
        assert!(store.list_custom_fields().is_empty());
    }
}
