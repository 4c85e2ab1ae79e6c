//! Token endpoint interaction
//!
//! A refresh is a form-encoded POST of `grant_type=refresh_token` plus the
//! client credentials to the region's accounts server. The endpoint answers
//! either `{access_token, expires_in, ...}` or `{error, error_description?}`,
//! and the error shape can arrive with a 2xx status.

use std::sync::Arc;
use std::time::Duration;

use common::{JsonSchema, Schema, Secret, ValidationMode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::constants::DEFAULT_TOKEN_TYPE;
use crate::error::{Error, Result};

/// Successful token endpoint payload.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when caching.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    pub fn token_type(&self) -> &str {
        self.token_type.as_deref().unwrap_or(DEFAULT_TOKEN_TYPE)
    }
}

pub const OAUTH_TOKEN_SCHEMA_NAME: &str = "OAuthTokenResponse";

/// Schema applied to refresh payloads unless the caller supplies one.
/// Unknown fields pass through.
pub fn oauth_token_schema() -> Result<Arc<dyn Schema>> {
    let document = json!({
        "type": "object",
        "required": ["access_token", "expires_in"],
        "properties": {
            "access_token": { "type": "string" },
            "expires_in": { "type": "number" },
            "token_type": { "type": "string" },
            "api_domain": { "type": "string" },
            "refresh_token": { "type": "string" }
        }
    });
    JsonSchema::shared(OAUTH_TOKEN_SCHEMA_NAME, &document)
        .map_err(|e| Error::InvalidConfig(e.to_string()))
}

/// Client credentials sent with every refresh.
pub struct RefreshGrant<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a Secret<String>,
    pub refresh_token: &'a Secret<String>,
}

/// POST the refresh grant and return the status with the decoded body.
///
/// Non-JSON bodies come back as `{"error": "invalid_json", "error_description": <text>}`
/// so the caller classifies them like any other endpoint error.
pub async fn request_token(
    client: &reqwest::Client,
    token_url: &str,
    grant: &RefreshGrant<'_>,
    timeout: Duration,
) -> Result<(u16, Value)> {
    let response = client
        .post(token_url)
        .timeout(timeout)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", grant.client_id),
            ("client_secret", grant.client_secret.expose().as_str()),
            ("refresh_token", grant.refresh_token.expose().as_str()),
        ])
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status().as_u16();
    let text = response.text().await.map_err(transport_error)?;
    let payload = serde_json::from_str::<Value>(&text)
        .unwrap_or_else(|_| json!({ "error": "invalid_json", "error_description": text }));
    Ok((status, payload))
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::credential("OAuth request timed out", Some(408), Some("TIMEOUT"))
    } else {
        Error::credential(
            format!("failed to reach OAuth endpoint: {e}"),
            None,
            Some("NETWORK_ERROR"),
        )
    }
}

/// Classify a token endpoint payload.
///
/// Order matters: HTTP errors first, then error payloads on success
/// statuses, then schema validation, then shape.
pub fn parse_token_payload(
    status: u16,
    payload: Value,
    schema: Option<&dyn Schema>,
    mode: ValidationMode,
) -> Result<TokenResponse> {
    if let Some(err) = oauth_error(status, &payload) {
        return Err(err);
    }
    if status >= 400 {
        return Err(Error::credential(
            format!("OAuth endpoint error (HTTP {status})"),
            Some(status),
            None,
        ));
    }

    let payload = match schema {
        Some(schema) if mode != ValidationMode::Off => {
            schema
                .validate(&payload, mode)
                .map_err(|issues| Error::SchemaMismatch {
                    schema: schema.name().to_string(),
                    issues,
                })?
        }
        _ => payload,
    };

    serde_json::from_value::<TokenResponse>(payload).map_err(|e| {
        Error::credential(
            format!("unexpected OAuth response format: {e}"),
            Some(status),
            None,
        )
    })
}

fn oauth_error(status: u16, payload: &Value) -> Option<Error> {
    let code = payload.get("error")?;
    let code = code.as_str().map(str::to_string).unwrap_or_else(|| code.to_string());
    let message = payload
        .get("error_description")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("OAuth error: {code}"));
    Some(Error::Credential {
        message,
        status: Some(status),
        code: Some(code),
    })
}
