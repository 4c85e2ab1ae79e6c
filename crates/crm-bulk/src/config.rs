//! Bulk job configuration and request payloads
//!
//! Enumerated options are Rust enums, so the allowed-value checks happen at
//! construction or deserialization. [`BulkReadConfig::validate`] and
//! [`BulkWriteConfig::validate`] cover the remaining free-form fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    Csv,
    Ics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackMethod {
    #[default]
    Post,
    Get,
}

/// Server calls this URL when the job finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCallback {
    pub url: String,
    #[serde(default)]
    pub method: CallbackMethod,
}

impl BulkCallback {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: CallbackMethod::Post,
        }
    }

    fn validate(&self) -> Result<()> {
        non_empty(&self.url, "callback.url")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkReadConfig {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<BulkCallback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
}

impl BulkReadConfig {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        non_empty(&self.module, "module")?;
        if let Some(fields) = &self.fields {
            for (index, field) in fields.iter().enumerate() {
                non_empty(field, &format!("fields[{index}]"))?;
            }
        }
        if self.criteria.as_ref().is_some_and(Map::is_empty) {
            return Err(Error::input("criteria", "criteria must not be empty"));
        }
        if let Some(callback) = &self.callback {
            callback.validate()?;
        }
        Ok(())
    }

    /// Request body for `POST /crm/bulk/v8/read`.
    pub fn payload(&self) -> Value {
        let mut query = Map::new();
        query.insert("module".into(), json!({ "api_name": self.module }));
        if let Some(criteria) = &self.criteria {
            query.insert("criteria".into(), Value::Object(criteria.clone()));
        }
        if let Some(fields) = &self.fields {
            query.insert("fields".into(), json!(fields));
        }
        if let Some(page) = self.page {
            query.insert("page".into(), json!(page));
        }
        if let Some(per_page) = self.per_page {
            query.insert("per_page".into(), json!(per_page));
        }
        if let Some(file_type) = self.file_type {
            query.insert("file_type".into(), json!(file_type));
        }

        let mut body = Map::new();
        if let Some(callback) = &self.callback {
            body.insert("callback".into(), json!(callback));
        }
        body.insert("query".into(), Value::Object(query));
        Value::Object(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Insert,
    Update,
    Upsert,
    Delete,
}

/// Maps a column of the uploaded file onto a module field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub api_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteConfig {
    pub operation: WriteOperation,
    pub module: String,
    /// Id returned by the file upload endpoint.
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<BulkCallback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_mappings: Option<Vec<FieldMapping>>,
    /// Unique field used to match records on upsert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_empty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_encoding: Option<String>,
}

impl BulkWriteConfig {
    pub fn new(
        operation: WriteOperation,
        module: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            module: module.into(),
            file_id: file_id.into(),
            callback: None,
            field_mappings: None,
            find_by: None,
            ignore_empty: None,
            character_encoding: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        non_empty(&self.module, "module")?;
        non_empty(&self.file_id, "file_id")?;
        if let Some(find_by) = &self.find_by {
            non_empty(find_by, "find_by")?;
        }
        if let Some(callback) = &self.callback {
            callback.validate()?;
        }
        for (index, mapping) in self.field_mappings.iter().flatten().enumerate() {
            non_empty(&mapping.api_name, &format!("field_mappings[{index}].api_name"))?;
        }
        Ok(())
    }

    /// Request body for `POST /crm/bulk/v8/write`.
    pub fn payload(&self) -> Value {
        let mut resource = Map::new();
        resource.insert("type".into(), json!("data"));
        resource.insert("module".into(), json!(self.module));
        resource.insert("file_id".into(), json!(self.file_id));
        if let Some(mappings) = &self.field_mappings {
            resource.insert("field_mappings".into(), json!(mappings));
        }
        if let Some(find_by) = &self.find_by {
            resource.insert("find_by".into(), json!(find_by));
        }
        if let Some(ignore_empty) = self.ignore_empty {
            resource.insert("ignore_empty".into(), json!(ignore_empty));
        }

        let mut body = Map::new();
        body.insert("operation".into(), json!(self.operation));
        if let Some(encoding) = &self.character_encoding {
            body.insert("character_encoding".into(), json!(encoding));
        }
        if let Some(callback) = &self.callback {
            body.insert("callback".into(), json!(callback));
        }
        body.insert("resource".into(), json!([resource]));
        Value::Object(body)
    }
}

/// Job ids are interpolated into the URL path; allow a single segment only.
pub(crate) fn validate_job_id(job_id: &str) -> Result<()> {
    non_empty(job_id, "job_id")?;
    let plain = job_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !plain || job_id.contains("..") {
        return Err(Error::input("job_id", "job_id must be a single path segment"));
    }
    Ok(())
}

fn non_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::input(field, format!("{field} must be a non-empty string")));
    }
    Ok(())
}
