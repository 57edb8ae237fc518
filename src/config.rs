use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use crate::ClientError;
use crate::credentials::{CredentialProvider, Token};

/// Resource family sharing concurrency and batch-limit configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Assets, events, files, sequences, relationships and similar resources.
    General,
    TimeSeries,
    Documents,
    Raw,
    /// Spaces, containers, views and data models.
    DataModelingSchema,
    /// Nodes and edges.
    DataModelingInstances,
    Workflows,
}

/// Kind of operation a request performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Retrieve,
    Update,
    Delete,
    List,
}

/// Maximum number of items per request for each operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationLimits {
    pub create: usize,
    pub retrieve: usize,
    pub update: usize,
    pub delete: usize,
    pub list: usize,
}

impl OperationLimits {
    /// The same limit for every operation kind.
    pub const fn uniform(limit: usize) -> Self {
        Self {
            create: limit,
            retrieve: limit,
            update: limit,
            delete: limit,
            list: limit,
        }
    }

    pub const fn get(&self, kind: OperationKind) -> usize {
        match kind {
            OperationKind::Create => self.create,
            OperationKind::Retrieve => self.retrieve,
            OperationKind::Update => self.update,
            OperationKind::Delete => self.delete,
            OperationKind::List => self.list,
        }
    }

    fn validate(&self) -> Result<(), ClientError> {
        if [self.create, self.retrieve, self.update, self.delete, self.list].contains(&0) {
            return Err(ClientError::Config(
                "batch limits must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for OperationLimits {
    fn default() -> Self {
        Self::uniform(1000)
    }
}

/// Per-domain batch limits with a fallback for unlisted domains.
#[derive(Clone, Debug)]
pub struct LimitSettings {
    pub default: OperationLimits,
    pub per_domain: HashMap<Domain, OperationLimits>,
}

impl LimitSettings {
    pub fn limits(&self, domain: Domain) -> OperationLimits {
        self.per_domain.get(&domain).copied().unwrap_or(self.default)
    }

    pub fn limit(&self, domain: Domain, kind: OperationKind) -> usize {
        self.limits(domain).get(kind)
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            default: OperationLimits::default(),
            per_domain: HashMap::from([(
                Domain::DataModelingSchema,
                OperationLimits::uniform(100),
            )]),
        }
    }
}

/// Concurrent request limits per `(domain, operation kind)`.
///
/// Each pair gets its own pool per project, so a burst against one
/// resource family does not starve another.
#[derive(Clone, Debug)]
pub struct ConcurrencySettings {
    pub default: usize,
    pub per_domain: HashMap<Domain, usize>,
    pub per_operation: HashMap<(Domain, OperationKind), usize>,
}

impl ConcurrencySettings {
    /// Most specific limit configured for the pair.
    pub fn limit(&self, domain: Domain, kind: OperationKind) -> usize {
        self.per_operation
            .get(&(domain, kind))
            .or_else(|| self.per_domain.get(&domain))
            .copied()
            .unwrap_or(self.default)
    }

    fn validate(&self) -> Result<(), ClientError> {
        let mut all = std::iter::once(&self.default)
            .chain(self.per_domain.values())
            .chain(self.per_operation.values());
        if all.any(|limit| *limit == 0) {
            return Err(ClientError::Config(
                "concurrency limits must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            default: 10,
            per_domain: HashMap::from([(Domain::DataModelingSchema, 2)]),
            per_operation: HashMap::new(),
        }
    }
}

/// Retry budgets and backoff shared by every request of a client.
#[derive(Clone, Debug)]
pub struct RetrySettings {
    /// Total attempts per request, first try included.
    pub max_attempts: u32,
    /// Retries after a connection could not be established.
    pub max_connect_retries: u32,
    /// Retries after a failure while sending or reading. Only used for
    /// requests classified as retryable.
    pub max_read_retries: u32,
    /// Retries after a response with a status in `retryable_statuses`.
    pub max_status_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub retryable_statuses: Vec<StatusCode>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_connect_retries: 3,
            max_read_retries: 5,
            max_status_retries: 10,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            retryable_statuses: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
        }
    }
}

/// Everything the client core needs to talk to one project.
#[derive(Clone)]
pub struct ClientConfig {
    pub project: String,
    pub base_url: String,
    pub api_version: String,
    /// Identifies the calling application in the `x-fusion-app` header.
    pub client_name: String,
    pub credentials: Arc<dyn CredentialProvider>,
    pub timeout: Duration,
    /// Send POST/PUT bodies uncompressed.
    pub disable_gzip: bool,
    /// Maximum chunks in flight for a single batch call.
    pub max_workers: usize,
    pub retry: RetrySettings,
    pub concurrency: ConcurrencySettings,
    pub limits: LimitSettings,
}

impl ClientConfig {
    pub fn new(
        project: impl Into<String>,
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            project: project.into(),
            base_url: base_url.into(),
            api_version: "v1".to_owned(),
            client_name: "fusion-client".to_owned(),
            credentials,
            timeout: Duration::from_secs(30),
            disable_gzip: false,
            max_workers: 5,
            retry: RetrySettings::default(),
            concurrency: ConcurrencySettings::default(),
            limits: LimitSettings::default(),
        }
    }

    /// Reads `FUSION_*` environment variables.
    ///
    /// `FUSION_PROJECT`, `FUSION_BASE_URL` and `FUSION_TOKEN` are required.
    /// `FUSION_CLIENT_NAME`, `FUSION_MAX_RETRIES`, `FUSION_MAX_RETRY_BACKOFF`
    /// (seconds), `FUSION_MAX_WORKERS` and `FUSION_DISABLE_GZIP` are optional.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ClientError::Config(format!("{key} is not set")))
        };
        let parsed = |key: &str| -> Result<Option<u64>, ClientError> {
            lookup(key)
                .map(|raw| {
                    raw.parse::<u64>().map_err(|_| {
                        ClientError::Config(format!("{key} must be an integer, got '{raw}'"))
                    })
                })
                .transpose()
        };

        let mut config = Self::new(
            required("FUSION_PROJECT")?,
            required("FUSION_BASE_URL")?,
            Arc::new(Token::new(required("FUSION_TOKEN")?)),
        );

        if let Some(name) = lookup("FUSION_CLIENT_NAME") {
            config.client_name = name;
        }
        if let Some(attempts) = parsed("FUSION_MAX_RETRIES")? {
            config.retry.max_attempts = u32::try_from(attempts)
                .map_err(|_| ClientError::Config("FUSION_MAX_RETRIES is too large".to_owned()))?;
        }
        if let Some(seconds) = parsed("FUSION_MAX_RETRY_BACKOFF")? {
            config.retry.backoff_cap = Duration::from_secs(seconds);
        }
        if let Some(workers) = parsed("FUSION_MAX_WORKERS")? {
            config.max_workers = usize::try_from(workers)
                .map_err(|_| ClientError::Config("FUSION_MAX_WORKERS is too large".to_owned()))?;
        }
        if let Some(flag) = lookup("FUSION_DISABLE_GZIP") {
            config.disable_gzip =
                matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Returns a config that authenticates with a static bearer token.
    #[must_use]
    pub fn with_authorization_token(mut self, token: impl Into<String>) -> Self {
        self.credentials = Arc::new(Token::new(token));
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: LimitSettings) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: ConcurrencySettings) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_gzip_disabled(mut self, disabled: bool) -> Self {
        self.disable_gzip = disabled;
        self
    }

    /// Checks invariants the client relies on.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.project.trim().is_empty() {
            return Err(ClientError::Config("project must not be empty".to_owned()));
        }
        if self.base_url.trim().is_empty() {
            return Err(ClientError::InvalidBaseUrl(self.base_url.clone()));
        }
        if self.max_workers == 0 {
            return Err(ClientError::Config("max_workers must be at least 1".to_owned()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ClientError::Config("max_attempts must be at least 1".to_owned()));
        }
        if self.retry.backoff_base > self.retry.backoff_cap {
            return Err(ClientError::Config(format!(
                "backoff base ({:?}) cannot exceed backoff cap ({:?})",
                self.retry.backoff_base, self.retry.backoff_cap
            )));
        }
        self.concurrency.validate()?;
        self.limits.default.validate()?;
        self.limits
            .per_domain
            .values()
            .try_for_each(OperationLimits::validate)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("project", &self.project)
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("client_name", &self.client_name)
            .field("timeout", &self.timeout)
            .field("disable_gzip", &self.disable_gzip)
            .field("max_workers", &self.max_workers)
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
