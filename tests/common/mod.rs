#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fusion_client::config::RetrySettings;
use fusion_client::{ClientConfig, Token};
use serde_json::{Value, json};
use wiremock::{Request, ResponseTemplate};

pub const PROJECT_ROOT: &str = "/api/v1/projects/demo";

/// Config pointed at a mock server: no backoff, uncompressed bodies.
pub fn config(server_uri: &str) -> ClientConfig {
    let retry = RetrySettings {
        backoff_base: Duration::ZERO,
        ..RetrySettings::default()
    };
    ClientConfig::new("demo", server_uri, Arc::new(Token::new("secret")))
        .with_retry(retry)
        .with_gzip_disabled(true)
}

pub fn path(resource: &str) -> String {
    format!("{PROJECT_ROOT}{resource}")
}

pub fn body_of(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap_or(Value::Null)
}

/// Serves `size` assets through POST list calls, with offsets as cursors.
pub fn collection(size: usize) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
    move |request: &Request| {
        let body = body_of(request);
        let start = body["cursor"]
            .as_str()
            .and_then(|cursor| cursor.parse().ok())
            .unwrap_or(0_usize);
        let limit = body["limit"]
            .as_u64()
            .and_then(|limit| usize::try_from(limit).ok())
            .unwrap_or(size);
        let end = (start + limit).min(size);
        let items: Vec<Value> = (start..end)
            .map(|index| json!({"id": index, "externalId": format!("asset-{index}")}))
            .collect();
        let next_cursor = if end < size {
            json!(end.to_string())
        } else {
            Value::Null
        };
        ResponseTemplate::new(200).set_body_json(json!({"items": items, "nextCursor": next_cursor}))
    }
}

/// Error envelope naming unknown identifiers.
pub fn missing(identifiers: Value) -> ResponseTemplate {
    ResponseTemplate::new(400).set_body_json(json!({
        "error": {"code": 400, "message": "Ids not found", "missing": identifiers}
    }))
}
