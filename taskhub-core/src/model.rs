//! Records and request bodies for tasks, owners and custom fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Owner {
    pub id: i64,
    pub name: String,
    pub email: String,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct OwnerInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Select,
    Multiselect,
}

impl FieldType {
    pub const ALL: [FieldType; 5] = [
        FieldType::Text,
        FieldType::Number,
        FieldType::Date,
        FieldType::Select,
        FieldType::Multiselect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::Select => "select",
            FieldType::Multiselect => "multiselect",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// Select-style fields carry a list of allowed options.
    pub fn needs_options(self) -> bool {
        matches!(self, FieldType::Select | FieldType::Multiselect)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CustomField {
    pub id: i64,
    pub name: String,
    pub field_type: FieldType,
    pub options: Option<Vec<Value>>,
    pub created_at: DateTime<Utc>,
}

/// Body of custom field create/update. `field_type` stays a raw string so
/// an unknown type is a validation error rather than a decode error.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct CustomFieldInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: i64,
    pub start_date: DateTime<Utc>,
    pub completion_percentage: i64,
    pub parent_id: Option<i64>,
    pub custom_fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task as listed, with the owner's name joined in.
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub owner_name: Option<String>,
}

/// Body of task create/update. On update only the fields present are
/// written; `description` and `parent_id` accept an explicit `null` to clear.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct TaskInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_percentage: Option<i64>,
    #[serde(default, deserialize_with = "present")]
    pub parent_id: Option<Option<i64>>,
    #[serde(default)]
    pub custom_fields: Option<Map<String, Value>>,
}

/// Distinguishes a missing key (`None`) from an explicit `null` (`Some(None)`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
