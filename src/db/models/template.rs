use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A named template with a subject, a body and a declared variable schema.
/// Rendering only ever uses the active version for a (type, channel).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub notification_type: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,

    /// JSON object: {"var": {"type": "string", "required": true}, ...}
    pub variables: String,

    pub language: String,
    pub active: bool,
    pub version: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Declared type and requiredness of one template variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableSpec {
    #[serde(rename = "type")]
    pub var_type: String,
    #[serde(default)]
    pub required: bool,
}

pub type VariableSchema = HashMap<String, VariableSpec>;

impl Template {
    pub fn schema(&self) -> VariableSchema {
        serde_json::from_str(&self.variables).unwrap_or_default()
    }

    pub fn required_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .schema()
            .into_iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }
}

/// Payload for creating or replacing a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    pub notification_type: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub variables: VariableSchema,
    #[serde(default)]
    pub language: Option<String>,
}
