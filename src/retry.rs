use std::future::Future;
use std::time::Duration;

use regex::Regex;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::ClientError;
use crate::config::RetrySettings;

/// POST endpoints that are idempotent server-side, relative to the project root.
///
/// Kept as data so the table can be audited and tested on its own. Anything
/// missing from here is sent with the strict retry policy.
pub const RETRYABLE_POST_ENDPOINTS: &[&str] = &[
    "/(assets|events|files|timeseries|sequences|datasets|relationships|labels)/(list|byids|search|aggregate)",
    "/files/downloadlink",
    "/timeseries/(data(/(list|latest|delete))?|synthetic/query)",
    "/sequences/data(/(list|delete))?",
    "/raw/dbs/[^/]+/tables/[^/]+/rows(/delete)?",
    "/context/entitymatching/(byids|list|jobs)",
    "/sessions/revoke",
    "/models/.*",
    ".*/graphql",
    "/units/.*",
    "/annotations/(list|byids|reverselookup)",
    r"/functions/(list|byids|status|schedules/(list|byids)|\d+/calls/(list|byids))",
    r"/3d/models/\d+/revisions/\d+/(mappings/list|nodes/(list|byids))",
    "/documents/(aggregate|list|search)",
    "/profiles/(byids|search)",
    "/geospatial/(compute|crs/byids|featuretypes/(byids|list))",
    "/transformations/(filter|byids|jobs/byids|schedules/byids|query/run)",
    "/extpipes/(list|byids|runs/list)",
    "/workflows/.*",
    "/hostedextractors/.*",
    "/context/diagram/.*",
];

/// Decides whether a request may be retried after a read failure.
#[derive(Clone, Debug)]
pub struct RetryClassifier {
    project_prefix: Regex,
    post_patterns: Vec<Regex>,
}

impl RetryClassifier {
    /// Builds a classifier from the built-in POST allow-list.
    pub fn new() -> Result<Self, ClientError> {
        Self::with_post_patterns(RETRYABLE_POST_ENDPOINTS)
    }

    /// Builds a classifier from a custom allow-list of path patterns.
    ///
    /// Each pattern is anchored and may be followed by a query string.
    pub fn with_post_patterns(patterns: &[&str]) -> Result<Self, ClientError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| {
                ClientError::Config(format!(
                    "invalid retryable endpoint pattern '{pattern}': {err}"
                ))
            })
        };
        let post_patterns = patterns
            .iter()
            .map(|pattern| compile(&format!("^{pattern}$")))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            project_prefix: compile(r"^(?:.*/projects/[^/]+)?(/[^?]*)")?,
            post_patterns,
        })
    }

    /// GET/PUT/PATCH/DELETE are always retryable; POST only on allow-listed paths.
    ///
    /// `path` may be a full URL or a project-relative path; everything up to
    /// `/projects/{project}` and any query string are ignored.
    pub fn is_retryable(&self, method: &Method, path: &str) -> Result<bool, ClientError> {
        match *method {
            Method::GET | Method::PUT | Method::PATCH | Method::DELETE => Ok(true),
            Method::POST => {
                let relative = self
                    .project_prefix
                    .captures(path)
                    .and_then(|captures| captures.get(1))
                    .map_or(path, |found| found.as_str());
                Ok(self
                    .post_patterns
                    .iter()
                    .any(|pattern| pattern.is_match(relative)))
            }
            _ => Err(ClientError::UnsupportedMethod(method.to_string())),
        }
    }
}

/// Budgets and backoff for one class of requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retryable_statuses: Vec<StatusCode>,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub max_read_retries: u32,
    pub max_connect_retries: u32,
    pub max_status_retries: u32,
}

impl RetryPolicy {
    /// Policy for idempotent requests.
    pub fn lenient(settings: &RetrySettings) -> Self {
        Self {
            retryable_statuses: settings.retryable_statuses.clone(),
            backoff_base: settings.backoff_base,
            backoff_cap: settings.backoff_cap,
            max_attempts: settings.max_attempts.max(1),
            max_read_retries: settings.max_read_retries,
            max_connect_retries: settings.max_connect_retries,
            max_status_retries: settings.max_status_retries,
        }
    }

    /// Policy for requests that must not be replayed once the server may have seen them.
    pub fn strict(settings: &RetrySettings) -> Self {
        Self {
            max_read_retries: 0,
            ..Self::lenient(settings)
        }
    }

    /// `min(base * 2^retry, cap)`, with `retry` counting from zero.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }

    fn retries_status(&self, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

/// Fully read response of one attempt.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub request_id: Option<String>,
    pub body: String,
}

/// Why an attempt produced no response.
#[derive(Debug)]
pub enum AttemptError {
    /// No connection was established; the server never saw the request.
    Connect(ClientError),
    /// The request may have reached the server.
    Read(ClientError),
    /// Not worth retrying.
    Fatal(ClientError),
}

impl AttemptError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Connect(err.into())
        } else if err.is_timeout() || err.is_request() || err.is_body() {
            Self::Read(err.into())
        } else {
            Self::Fatal(err.into())
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum FailureClass {
    Connect,
    Read,
    Status,
}

#[derive(Debug, Default)]
struct RetryTracker {
    attempts: u32,
    connect: u32,
    read: u32,
    status: u32,
}

impl RetryTracker {
    fn retries(&self) -> u32 {
        self.connect + self.read + self.status
    }

    /// Records a failure and reports whether another attempt is allowed.
    fn allow(&mut self, policy: &RetryPolicy, class: FailureClass) -> bool {
        if self.attempts >= policy.max_attempts {
            return false;
        }
        let (used, budget) = match class {
            FailureClass::Connect => (&mut self.connect, policy.max_connect_retries),
            FailureClass::Read => (&mut self.read, policy.max_read_retries),
            FailureClass::Status => (&mut self.status, policy.max_status_retries),
        };
        if *used >= budget {
            return false;
        }
        *used += 1;
        true
    }
}

/// Runs attempts under a [`RetryPolicy`], choosing strict or lenient per request.
#[derive(Clone, Debug)]
pub struct RetryingExecutor {
    classifier: RetryClassifier,
    lenient: RetryPolicy,
    strict: RetryPolicy,
}

impl RetryingExecutor {
    pub fn new(classifier: RetryClassifier, settings: &RetrySettings) -> Self {
        Self {
            classifier,
            lenient: RetryPolicy::lenient(settings),
            strict: RetryPolicy::strict(settings),
        }
    }

    pub fn classifier(&self) -> &RetryClassifier {
        &self.classifier
    }

    /// Policy that applies to `method` on `path`.
    pub fn policy_for(&self, method: &Method, path: &str) -> Result<&RetryPolicy, ClientError> {
        if self.classifier.is_retryable(method, path)? {
            Ok(&self.lenient)
        } else {
            Ok(&self.strict)
        }
    }

    /// Calls `attempt` until it yields a final outcome or a budget runs out.
    ///
    /// Responses with a non-retryable status are returned as-is, success or
    /// not. When a budget is exhausted the last response or error is returned.
    pub async fn run<F, Fut>(
        policy: &RetryPolicy,
        mut attempt: F,
    ) -> Result<RawResponse, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RawResponse, AttemptError>>,
    {
        let mut tracker = RetryTracker::default();

        loop {
            tracker.attempts += 1;
            let retry_number = tracker.retries();

            let class = match attempt().await {
                Ok(response) if policy.retries_status(response.status) => {
                    if !tracker.allow(policy, FailureClass::Status) {
                        debug!(
                            status = %response.status,
                            attempts = tracker.attempts,
                            "status retries exhausted"
                        );
                        return Ok(response);
                    }
                    warn!(
                        status = %response.status,
                        attempt = tracker.attempts,
                        "retryable status"
                    );
                    FailureClass::Status
                }
                Ok(response) => return Ok(response),
                Err(AttemptError::Connect(error)) => {
                    if !tracker.allow(policy, FailureClass::Connect) {
                        return Err(error);
                    }
                    warn!(%error, attempt = tracker.attempts, "connect failure");
                    FailureClass::Connect
                }
                Err(AttemptError::Read(error)) => {
                    if !tracker.allow(policy, FailureClass::Read) {
                        return Err(error);
                    }
                    warn!(%error, attempt = tracker.attempts, "read failure");
                    FailureClass::Read
                }
                Err(AttemptError::Fatal(error)) => return Err(error),
            };

            let delay = policy.backoff(retry_number);
            debug!(?class, ?delay, "backing off before retry");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
