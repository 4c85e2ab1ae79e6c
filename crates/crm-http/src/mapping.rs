//! Response classification and URL helpers

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};

use crate::error::{Error, FieldErrors, Result};

/// Headers checked, in order, for a request id to put in audit events.
const REQUEST_ID_HEADERS: &[&str] = &[
    "x-request-id",
    "x-zoho-requestid",
    "x-zoho-request-id",
    "x-zoho-trace-id",
];

/// Error body the API returns: `{code, message, status, details?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<Value>,
}

/// Find the vendor error object at the top level or as `data[0]`.
pub fn extract_api_error(payload: &Value) -> Option<ApiErrorDetails> {
    fn as_error(value: &Value) -> Option<ApiErrorDetails> {
        let obj = value.as_object()?;
        if !(obj.contains_key("code") && obj.contains_key("message") && obj.contains_key("status")) {
            return None;
        }
        Some(ApiErrorDetails {
            code: obj.get("code").and_then(scalar_string),
            message: obj.get("message").and_then(scalar_string),
            details: obj.get("details").filter(|d| !d.is_null()).cloned(),
        })
    }

    as_error(payload).or_else(|| payload.get("data")?.get(0).and_then(as_error))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map a non-2xx response onto the error taxonomy.
pub fn map_status(
    status: u16,
    payload: &Value,
    headers: &BTreeMap<String, String>,
    path: &str,
) -> Error {
    let api = extract_api_error(payload);
    let message = api.as_ref().and_then(|a| a.message.clone());
    let code = api.as_ref().and_then(|a| a.code.clone());
    let details = api.as_ref().and_then(|a| a.details.clone());

    match status {
        400 => Error::Validation {
            message: message.unwrap_or_else(|| "Validation error.".into()),
            field_errors: api.as_ref().map(extract_field_errors).unwrap_or_default(),
            code,
            details,
        },
        401 => Error::Credential {
            message: message.unwrap_or_else(|| "Unauthorized request.".into()),
            status: Some(401),
            code,
        },
        404 => {
            let (resource, id) = extract_resource_info(path);
            Error::NotFound {
                message: message.unwrap_or_else(|| "Resource not found.".into()),
                code,
                resource,
                id,
            }
        }
        429 => Error::RateLimit {
            message: message.unwrap_or_else(|| "Rate limit exceeded.".into()),
            code,
            retry_after: parse_retry_after(headers),
        },
        500..=504 => Error::Request {
            message: message.unwrap_or_else(|| "Server error.".into()),
            status: Some(status),
            code,
        },
        _ => Error::Request {
            message: message.unwrap_or_else(|| "Unexpected API error.".into()),
            status: Some(status),
            code,
        },
    }
}

/// Field errors from `details.api_name` or a `details.errors` map.
pub fn extract_field_errors(api: &ApiErrorDetails) -> FieldErrors {
    let mut fields = FieldErrors::new();
    let Some(details) = api.details.as_ref().and_then(Value::as_object) else {
        return fields;
    };

    if let Some(api_name) = details.get("api_name").and_then(Value::as_str) {
        let message = api
            .message
            .clone()
            .unwrap_or_else(|| "Validation error.".into());
        fields.insert(api_name.to_string(), vec![message]);
        return fields;
    }

    if let Some(errors) = details.get("errors").and_then(Value::as_object) {
        for (field, value) in errors {
            match value {
                Value::String(message) => {
                    fields.insert(field.clone(), vec![message.clone()]);
                }
                Value::Array(entries) => {
                    let messages = entries
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                    fields.insert(field.clone(), messages);
                }
                _ => {}
            }
        }
    }
    fields
}

/// `Retry-After` in (possibly fractional) seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &BTreeMap<String, String>) -> Option<Duration> {
    let seconds: f64 = headers.get("retry-after")?.trim().parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Resource name and record id guessed from a request path.
///
/// `/crm/v2/Leads/123` gives `(Leads, 123)`; otherwise the last two
/// segments are used.
pub fn extract_resource_info(path: &str) -> (Option<String>, Option<String>) {
    let path = sanitize_path(path);
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return (None, None);
    }

    if let Some(crm) = parts.iter().position(|p| p.eq_ignore_ascii_case("crm")) {
        if parts.len() > crm + 2 {
            let resource = parts[crm + 2].to_string();
            let id = parts.get(crm + 3).map(|s| s.to_string());
            return (Some(resource), id);
        }
    }

    match parts.as_slice() {
        [only] => (Some(only.to_string()), None),
        [.., resource, id] => (Some(resource.to_string()), Some(id.to_string())),
        [] => (None, None),
    }
}

/// Path without query string; the path component of absolute URLs.
pub fn sanitize_path(path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        if let Ok(url) = Url::parse(path) {
            return url.path().to_string();
        }
    }
    path.split('?').next().unwrap_or(path).to_string()
}

pub fn request_id(headers: &BTreeMap<String, String>) -> Option<String> {
    REQUEST_ID_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).filter(|v| !v.is_empty()).cloned())
}

/// Lowercase names; repeated headers joined with `", "`; non-UTF-8 values dropped.
pub fn normalize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut normalized: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        normalized
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    normalized
}

/// Decode a response body: JSON if possible, else `{message: text}`, else null.
pub fn read_json_safely(body: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice(body) {
        return value;
    }
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        Value::Null
    } else {
        json!({ "message": text })
    }
}

/// Final request URL.
///
/// Absolute URLs are used as given; paths already under `/crm/` are joined
/// to `base_url`; anything else gets `default_api_path` in between.
pub fn build_url(
    base_url: &str,
    default_api_path: &str,
    path: &str,
    params: &[(String, String)],
) -> Result<Url> {
    let raw = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        let base = base_url.trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        if path.starts_with("/crm/") {
            format!("{base}{path}")
        } else {
            format!("{base}{}{path}", default_api_path.trim_end_matches('/'))
        }
    };

    let mut url = Url::parse(&raw)
        .map_err(|e| Error::input("path", format!("invalid request URL \"{raw}\": {e}")))?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}
