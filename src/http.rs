use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{self, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::credentials::CredentialProvider;
use crate::retry::{AttemptError, RawResponse};
use crate::{ClientConfig, ClientError};

const SDK_HEADER: &str = "x-fusion-sdk";
const APP_HEADER: &str = "x-fusion-app";
const REQUEST_ID_HEADER: &str = "x-request-id";
const SDK_VERSION: &str = concat!("fusion-client-rust/", env!("CARGO_PKG_VERSION"));

/// One logical API call, relative to the project root.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    /// Path below `/projects/{project}`, for example `/assets/list`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Request with its URL resolved and body encoded, ready to be sent any number of times.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    query: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    gzipped: bool,
    request_id: String,
}

impl PreparedRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// Issues single HTTP round trips against one project.
#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    project_url: Url,
    credentials: Arc<dyn CredentialProvider>,
    client_name: HeaderValue,
    disable_gzip: bool,
}

impl Transport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let base = Url::parse(&config.base_url)
            .map_err(|_| ClientError::InvalidBaseUrl(config.base_url.clone()))?;
        let project_url = ensure_trailing_slash(base)
            .join(&format!("api/{}/projects/{}/", config.api_version, config.project))
            .map_err(|_| ClientError::InvalidBaseUrl(config.base_url.clone()))?;
        let client_name = HeaderValue::from_str(&config.client_name).map_err(|_| {
            ClientError::Config(format!("invalid client name '{}'", config.client_name))
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(SDK_VERSION)
            .build()?;

        Ok(Self {
            http,
            project_url,
            credentials: Arc::clone(&config.credentials),
            client_name,
            disable_gzip: config.disable_gzip,
        })
    }

    /// Resolves the URL and encodes the body once for all attempts.
    pub fn prepare(&self, request: &ApiRequest) -> Result<PreparedRequest, ClientError> {
        let url = self.build_url(&request.path)?;
        let compress = !self.disable_gzip && matches!(request.method, Method::POST | Method::PUT);

        let body = request
            .body
            .as_ref()
            .map(|body| -> Result<Vec<u8>, ClientError> {
                let raw = serde_json::to_vec(body)?;
                if compress { gzip(&raw) } else { Ok(raw) }
            })
            .transpose()?;

        Ok(PreparedRequest {
            method: request.method.clone(),
            url,
            query: request.query.clone(),
            gzipped: compress && body.is_some(),
            body,
            request_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Sends one attempt and reads the full response body.
    ///
    /// The authorization header is fetched anew on every call.
    pub async fn send(&self, request: &PreparedRequest) -> Result<RawResponse, AttemptError> {
        let authorization = self
            .credentials
            .authorization_header()
            .await
            .map_err(AttemptError::Fatal)?;

        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .header(header::ACCEPT, "application/json")
            .header(header::AUTHORIZATION, authorization)
            .header(SDK_HEADER, SDK_VERSION)
            .header(APP_HEADER, self.client_name.clone())
            .header(REQUEST_ID_HEADER, request.request_id.as_str());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        if let Some(body) = &request.body {
            builder = builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone());
            if request.gzipped {
                builder = builder.header(header::CONTENT_ENCODING, "gzip");
            }
        }

        debug!(
            method = %request.method,
            url = %request.url,
            request_id = %request.request_id,
            "sending request"
        );

        let response = builder.send().await.map_err(AttemptError::from_reqwest)?;
        let status = response.status();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.map_err(AttemptError::from_reqwest)?;

        debug!(method = %request.method, url = %request.url, %status, "received response");

        Ok(RawResponse {
            status,
            request_id,
            body,
        })
    }

    fn build_url(&self, path: &str) -> Result<Url, ClientError> {
        let relative = path.trim_start_matches('/');
        self.project_url
            .join(relative)
            .map_err(|_| ClientError::InvalidPath(path.to_owned()))
    }
}

fn gzip(raw: &[u8]) -> Result<Vec<u8>, ClientError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).map_err(ClientError::Compression)?;
    encoder.finish().map_err(ClientError::Compression)
}

fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let mut path = url.path().to_owned();
        path.push('/');
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use flate2::read::GzDecoder;
    use reqwest::Method;
    use serde_json::json;

    use super::{ApiRequest, Transport};
    use crate::{ClientConfig, Token};

    fn transport(base_url: &str, disable_gzip: bool) -> Transport {
        let config = ClientConfig::new("demo", base_url, Arc::new(Token::new("t")))
            .with_gzip_disabled(disable_gzip);
        Transport::new(&config).expect("valid config")
    }

    #[test]
    fn joins_paths_below_the_project_root() {
        let transport = transport("https://example.com/base", false);
        let prepared = transport
            .prepare(&ApiRequest::new(Method::GET, "/assets/byids"))
            .expect("prepared");
        assert_eq!(
            prepared.url.as_str(),
            "https://example.com/base/api/v1/projects/demo/assets/byids"
        );
    }

    #[test]
    fn compresses_post_bodies_unless_disabled() {
        let request = ApiRequest::new(Method::POST, "/assets").with_body(json!({"items": [1]}));

        let prepared = transport("https://example.com", false)
            .prepare(&request)
            .expect("prepared");
        assert!(prepared.gzipped);
        let mut decoded = String::new();
        GzDecoder::new(prepared.body.as_deref().expect("body"))
            .read_to_string(&mut decoded)
            .expect("valid gzip");
        assert_eq!(decoded, r#"{"items":[1]}"#);

        let plain = transport("https://example.com", true)
            .prepare(&request)
            .expect("prepared");
        assert!(!plain.gzipped);
        assert_eq!(plain.body.as_deref(), Some(br#"{"items":[1]}"#.as_slice()));
    }

    #[test]
    fn never_compresses_get_requests() {
        let request = ApiRequest::new(Method::GET, "/assets").with_body(json!({}));
        let prepared = transport("https://example.com", false)
            .prepare(&request)
            .expect("prepared");
        assert!(!prepared.gzipped);
    }

    #[test]
    fn each_logical_request_gets_its_own_id() {
        let transport = transport("https://example.com", false);
        let request = ApiRequest::new(Method::GET, "/assets");
        let first = transport.prepare(&request).expect("prepared");
        let second = transport.prepare(&request).expect("prepared");
        assert_ne!(first.request_id(), second.request_id());
    }
}
