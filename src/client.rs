use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::admission::{AdmissionController, AdmissionKey};
use crate::config::{Domain, OperationKind};
use crate::error::ApiError;
use crate::http::{ApiRequest, Transport};
use crate::identifiers::{Identifier, IdentifierSequence};
use crate::pagination::{ListRequest, Page, PageSource, chunk_stream, item_stream};
use crate::retry::{AttemptError, RawResponse, RetryClassifier, RetryingExecutor};
use crate::tasks::{FailureMode, TaskOutcome, execute_tasks};
use crate::update::{UpdateMode, to_update_item};
use crate::{ClientConfig, ClientError};

/// A resource collection: the domain whose limits apply and its path below the project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceEndpoint {
    pub domain: Domain,
    /// Collection path, for example `/assets` or `/models/instances`.
    pub path: String,
}

impl ResourceEndpoint {
    pub fn new(domain: Domain, path: impl Into<String>) -> Self {
        Self {
            domain,
            path: path.into(),
        }
    }

    fn action(&self, action: &str) -> String {
        format!("{}/{action}", self.path.trim_end_matches('/'))
    }
}

/// Result of [`ApiClient::retrieve_multiple`], shaped by the request.
#[derive(Clone, Debug, PartialEq)]
pub enum Retrieved {
    /// Singleton request; `None` when the identifier is unknown.
    Single(Option<Value>),
    List(Vec<Value>),
}

impl Retrieved {
    pub fn into_items(self) -> Vec<Value> {
        match self {
            Self::Single(item) => item.into_iter().collect(),
            Self::List(items) => items,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RetrieveOptions {
    /// Leave unknown identifiers out of the result instead of failing.
    pub ignore_unknown_ids: bool,
    pub failure_mode: FailureMode,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    pub failure_mode: FailureMode,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOptions {
    pub ignore_unknown_ids: bool,
    pub failure_mode: FailureMode,
}

struct Inner {
    config: ClientConfig,
    transport: Transport,
    executor: RetryingExecutor,
    admission: AdmissionController,
}

/// Async client for one project.
///
/// Cloning is cheap and clones share the transport, retry policies and
/// admission pools.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Creates a client, validating `config` first.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_classifier(config, RetryClassifier::new()?)
    }

    /// Creates a client that classifies POST retryability with `classifier`.
    pub fn with_classifier(
        config: ClientConfig,
        classifier: RetryClassifier,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let transport = Transport::new(&config)?;
        let executor = RetryingExecutor::new(classifier, &config.retry);
        let admission = AdmissionController::new(config.concurrency.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                executor,
                admission,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Sends a `GET` request and parses the response as JSON.
    pub async fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        self.request_json(Method::GET, path, None).await
    }

    /// Sends a `GET` request with query parameters and parses the response as JSON.
    pub async fn get_json_with_query(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        self.request_json_with_query(Method::GET, path, query, None)
            .await
    }

    /// Sends a `POST` request with a JSON body and parses the response as JSON.
    pub async fn post_json(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.request_json(Method::POST, path, Some(body)).await
    }

    /// Sends a `PUT` request with a JSON body and parses the response as JSON.
    pub async fn put_json(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.request_json(Method::PUT, path, Some(body)).await
    }

    /// Sends a `DELETE` request and parses the response as JSON.
    pub async fn delete_json(&self, path: &str) -> Result<Value, ClientError> {
        self.request_json(Method::DELETE, path, None).await
    }

    /// Sends a request and parses the response as JSON.
    ///
    /// Use [`Self::request_json_with_query`] when query parameters are needed.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.request_json_with_query(method, path, &[], body).await
    }

    /// Sends a request with query parameters and parses the response as JSON.
    ///
    /// `path` is relative to the project root. Raw requests are admitted
    /// through the [`Domain::General`] pools: `POST` to a `/list`, `/byids`,
    /// `/search` or `/aggregate` action counts as a read, other `POST`s as
    /// creates. Returns [`Value::Null`] for successful responses with an
    /// empty body.
    pub async fn request_json_with_query(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let kind = operation_kind(&method, path);
        let mut request = ApiRequest::new(method, path);
        for (key, value) in query {
            request = request.with_query(*key, *value);
        }
        if let Some(body) = body {
            request = request.with_body(body);
        }
        self.execute(Domain::General, kind, request).await
    }

    /// One logical request: classification, admission per attempt, retries and decoding.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn execute(
        &self,
        domain: Domain,
        kind: OperationKind,
        request: ApiRequest,
    ) -> Result<Value, ClientError> {
        let inner = &*self.inner;
        let policy = inner.executor.policy_for(&request.method, &request.path)?;
        let prepared = inner.transport.prepare(&request)?;
        let key = AdmissionKey::new(domain, kind, inner.config.project.as_str());

        let prepared = &prepared;
        let key = &key;
        let response = RetryingExecutor::run(policy, || async move {
            let _ticket = inner
                .admission
                .acquire(key.clone())
                .await
                .map_err(AttemptError::Fatal)?;
            inner.transport.send(prepared).await
        })
        .await?;

        self.decode(response)
    }

    fn decode(&self, response: RawResponse) -> Result<Value, ClientError> {
        let RawResponse {
            status,
            request_id,
            body,
        } = response;

        if !status.is_success() {
            let error = ApiError::from_response(status, &body, request_id);
            debug!(%status, message = %error.message, "request failed");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Authorization {
                    project: self.inner.config.project.clone(),
                    error,
                },
                _ => ClientError::Api(error),
            });
        }

        if body.trim().is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_str(&body)?)
        }
    }

    async fn execute_items(
        &self,
        domain: Domain,
        kind: OperationKind,
        request: ApiRequest,
    ) -> Result<Vec<Value>, ClientError> {
        let body = self.execute(domain, kind, request).await?;
        Page::from_response(body).map(|page| page.items)
    }

    /// Fetches resources by identifier, one `byids` request per chunk.
    ///
    /// A singleton request yields [`Retrieved::Single`], with `None` when the
    /// service does not know the identifier. Batches yield every resource in
    /// input order or a [`ClientError::Batch`] naming each unresolved input.
    #[instrument(skip(self, ids), fields(path = %endpoint.path, count = ids.len()))]
    pub async fn retrieve_multiple(
        &self,
        endpoint: &ResourceEndpoint,
        ids: &IdentifierSequence,
        options: RetrieveOptions,
    ) -> Result<Retrieved, ClientError> {
        ids.ensure_non_empty()?;
        let limit = self.inner.config.limits.limit(endpoint.domain, OperationKind::Retrieve);

        let client = self.clone();
        let target = endpoint.clone();
        let summary = execute_tasks(
            ids.chunks(limit),
            self.inner.config.max_workers,
            options.failure_mode,
            move |chunk: IdentifierSequence| {
                let client = client.clone();
                let target = target.clone();
                async move {
                    let body = json!({
                        "items": chunk.as_items(),
                        "ignoreUnknownIds": options.ignore_unknown_ids,
                    });
                    let request =
                        ApiRequest::new(Method::POST, target.action("byids")).with_body(body);
                    client
                        .execute_items(target.domain, OperationKind::Retrieve, request)
                        .await
                }
            },
        )
        .await?;

        if !ids.is_singleton() {
            return summary.into_items().map(Retrieved::List);
        }

        match summary.outcomes.into_iter().next() {
            Some(TaskOutcome::Succeeded { output, .. }) => {
                Ok(Retrieved::Single(output.into_iter().next()))
            }
            Some(TaskOutcome::Failed { error, .. }) if error.is_not_found() => {
                debug!("singleton identifier not found");
                Ok(Retrieved::Single(None))
            }
            Some(TaskOutcome::Failed { error, .. }) => Err(error),
            Some(TaskOutcome::Cancelled { .. } | TaskOutcome::Skipped { .. }) | None => {
                Ok(Retrieved::Single(None))
            }
        }
    }

    /// Creates resources, returning what the service stored in input order.
    #[instrument(skip(self, items), fields(path = %endpoint.path, count = items.len()))]
    pub async fn create_multiple(
        &self,
        endpoint: &ResourceEndpoint,
        items: Vec<Value>,
        options: WriteOptions,
    ) -> Result<Vec<Value>, ClientError> {
        let path = endpoint.path.clone();
        self.write_items(endpoint, OperationKind::Create, path, items, options.failure_mode)
            .await
    }

    /// Updates resources given in their full form.
    ///
    /// Each item must carry `id` or `externalId` and is turned into an update
    /// object according to `mode` before anything is sent.
    #[instrument(skip(self, items), fields(path = %endpoint.path, count = items.len()))]
    pub async fn update_multiple(
        &self,
        endpoint: &ResourceEndpoint,
        items: &[Value],
        mode: UpdateMode,
        options: WriteOptions,
    ) -> Result<Vec<Value>, ClientError> {
        let updates = items
            .iter()
            .map(|item| to_update_item(item, mode))
            .collect::<Result<Vec<_>, _>>()?;
        self.write_items(
            endpoint,
            OperationKind::Update,
            endpoint.action("update"),
            updates,
            options.failure_mode,
        )
        .await
    }

    /// Updates what exists and creates the rest.
    ///
    /// Items reported unknown by the update are created. Items that shared a
    /// rejected chunk with them are updated again. Resources come back in the
    /// order of `items`.
    #[instrument(skip(self, items), fields(path = %endpoint.path, count = items.len()))]
    pub async fn upsert(
        &self,
        endpoint: &ResourceEndpoint,
        items: Vec<Value>,
        mode: UpdateMode,
        options: WriteOptions,
    ) -> Result<Vec<Value>, ClientError> {
        let failure = match self.update_multiple(endpoint, &items, mode, options).await {
            Err(ClientError::Batch(failure))
                if !failure.not_found.is_empty()
                    && failure.unknown.is_empty()
                    && failure.skipped.is_empty()
                    && failure
                        .failed
                        .iter()
                        .all(|entry| matches!(*entry.cause, ClientError::ChunkRejected(_))) =>
            {
                *failure
            }
            other => return other,
        };

        let missing: HashSet<Identifier> = failure
            .not_found
            .iter()
            .filter_map(Identifier::from_json)
            .collect();
        let rejected: HashSet<Identifier> = failure
            .failed
            .iter()
            .filter_map(|entry| Identifier::from_json(&entry.item))
            .collect();

        let mut to_create = Vec::new();
        let mut to_update = Vec::new();
        for item in &items {
            let Some(id) = Identifier::from_json(item) else {
                continue;
            };
            if missing.contains(&id) {
                to_create.push(item.clone());
            } else if rejected.contains(&id) {
                to_update.push(item.clone());
            }
        }
        debug!(create = to_create.len(), update = to_update.len(), "upsert second pass");

        let mut stored = failure.successful;
        if !to_create.is_empty() {
            stored.extend(self.create_multiple(endpoint, to_create, options).await?);
        }
        if !to_update.is_empty() {
            stored.extend(self.update_multiple(endpoint, &to_update, mode, options).await?);
        }
        Ok(in_input_order(&items, stored))
    }

    async fn write_items(
        &self,
        endpoint: &ResourceEndpoint,
        kind: OperationKind,
        path: String,
        items: Vec<Value>,
        failure_mode: FailureMode,
    ) -> Result<Vec<Value>, ClientError> {
        if items.is_empty() {
            return Err(ClientError::EmptyInput);
        }
        let limit = self.inner.config.limits.limit(endpoint.domain, kind);
        let chunks: Vec<Vec<Value>> = items.chunks(limit).map(<[Value]>::to_vec).collect();

        let client = self.clone();
        let domain = endpoint.domain;
        let summary = execute_tasks(
            chunks,
            self.inner.config.max_workers,
            failure_mode,
            move |chunk: Vec<Value>| {
                let client = client.clone();
                let body = json!({ "items": chunk });
                let request = ApiRequest::new(Method::POST, path.clone()).with_body(body);
                async move { client.execute_items(domain, kind, request).await }
            },
        )
        .await?;

        summary
            .into_outputs(|chunk: &Vec<Value>| chunk.clone(), |_, stored| stored.clone())
            .map(|chunks| chunks.into_iter().flatten().collect())
    }

    /// Deletes resources by identifier.
    #[instrument(skip(self, ids), fields(path = %endpoint.path, count = ids.len()))]
    pub async fn delete_multiple(
        &self,
        endpoint: &ResourceEndpoint,
        ids: &IdentifierSequence,
        options: DeleteOptions,
    ) -> Result<(), ClientError> {
        ids.ensure_non_empty()?;
        let limit = self.inner.config.limits.limit(endpoint.domain, OperationKind::Delete);

        let client = self.clone();
        let target = endpoint.clone();
        let summary = execute_tasks(
            ids.chunks(limit),
            self.inner.config.max_workers,
            options.failure_mode,
            move |chunk: IdentifierSequence| {
                let client = client.clone();
                let target = target.clone();
                async move {
                    let body = json!({
                        "items": chunk.as_items(),
                        "ignoreUnknownIds": options.ignore_unknown_ids,
                    });
                    let request =
                        ApiRequest::new(Method::POST, target.action("delete")).with_body(body);
                    client
                        .execute(target.domain, OperationKind::Delete, request)
                        .await
                        .map(drop)
                }
            },
        )
        .await?;

        summary
            .into_outputs(IdentifierSequence::as_items, |chunk, _| chunk.as_items())
            .map(drop)
    }

    /// Runs an aggregation and returns its `items`.
    #[instrument(skip(self, body), fields(path = %endpoint.path))]
    pub async fn aggregate(
        &self,
        endpoint: &ResourceEndpoint,
        body: Value,
    ) -> Result<Vec<Value>, ClientError> {
        let request = ApiRequest::new(Method::POST, endpoint.action("aggregate")).with_body(body);
        self.execute_items(endpoint.domain, OperationKind::Retrieve, request)
            .await
    }

    fn page_source(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
    ) -> Arc<dyn PageSource> {
        let path = if request.method == Method::POST {
            endpoint.action("list")
        } else {
            endpoint.path.clone()
        };
        Arc::new(ListPages {
            client: self.clone(),
            domain: endpoint.domain,
            path,
            request,
        })
    }

    fn page_size(&self, endpoint: &ResourceEndpoint) -> usize {
        self.inner.config.limits.limit(endpoint.domain, OperationKind::List)
    }

    /// Lazily lists items, fetching the next page only when the current one is consumed.
    pub fn list_stream(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
    ) -> BoxStream<'static, Result<Value, ClientError>> {
        let (limit, cursor) = (request.limit, request.cursor.clone());
        item_stream(self.page_source(endpoint, request), self.page_size(endpoint), limit, cursor)
    }

    /// Lazily lists items in groups of `chunk_size`; the last group may be smaller.
    pub fn list_chunks(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
        chunk_size: usize,
    ) -> BoxStream<'static, Result<Vec<Value>, ClientError>> {
        let (limit, cursor) = (request.limit, request.cursor.clone());
        chunk_stream(
            self.page_source(endpoint, request),
            self.page_size(endpoint),
            chunk_size,
            limit,
            cursor,
        )
    }

    /// Lists every item (up to `request.limit`).
    #[instrument(skip(self, request), fields(path = %endpoint.path, limit = ?request.limit))]
    pub async fn list(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
    ) -> Result<Vec<Value>, ClientError> {
        self.list_stream(endpoint, request).try_collect().await
    }

    /// Lists with `partitions` cursors in parallel and concatenates them in partition order.
    ///
    /// Partitions cannot honour an overall limit, so `request.limit` must be unset.
    #[instrument(skip(self, request), fields(path = %endpoint.path))]
    pub async fn list_partitioned(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
        partitions: usize,
    ) -> Result<Vec<Value>, ClientError> {
        if request.limit.is_some() {
            return Err(ClientError::Config(
                "partitioned listing cannot be combined with a limit".to_owned(),
            ));
        }
        if partitions <= 1 {
            return self.list(endpoint, request).await;
        }

        let inputs: Vec<ListRequest> = (1..=partitions)
            .map(|index| {
                let mut partition = request.clone();
                partition.partition = Some((index, partitions));
                partition
            })
            .collect();

        let client = self.clone();
        let target = endpoint.clone();
        let summary = execute_tasks(
            inputs,
            self.inner.config.max_workers,
            FailureMode::FailFast,
            move |partition: ListRequest| {
                let client = client.clone();
                let target = target.clone();
                async move { client.list(&target, partition).await }
            },
        )
        .await?;

        let mut items = Vec::new();
        for outcome in summary.outcomes {
            match outcome {
                TaskOutcome::Succeeded { output, .. } => items.extend(output),
                TaskOutcome::Failed { error, .. } => return Err(error),
                TaskOutcome::Cancelled { .. } | TaskOutcome::Skipped { .. } => {}
            }
        }
        Ok(items)
    }
}

/// Reorders `stored` resources to follow the identifiers of `inputs`.
///
/// Resources that match no input keep their relative order at the end.
fn in_input_order(inputs: &[Value], stored: Vec<Value>) -> Vec<Value> {
    let mut pending: Vec<Option<Value>> = stored.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(pending.len());
    for id in inputs.iter().filter_map(Identifier::from_json) {
        let found = pending
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|resource| id.addresses(resource)));
        if let Some(resource) = found.and_then(Option::take) {
            ordered.push(resource);
        }
    }
    ordered.extend(pending.into_iter().flatten());
    ordered
}

/// Read-shaped `POST` actions and the pool they are admitted through.
const POST_ACTION_KINDS: &[(&str, OperationKind)] = &[
    ("/list", OperationKind::List),
    ("/byids", OperationKind::Retrieve),
    ("/search", OperationKind::Retrieve),
    ("/aggregate", OperationKind::Retrieve),
    ("/update", OperationKind::Update),
    ("/delete", OperationKind::Delete),
];

/// Admission pool for a raw request.
fn operation_kind(method: &Method, path: &str) -> OperationKind {
    match *method {
        Method::GET => OperationKind::Retrieve,
        Method::PUT | Method::PATCH => OperationKind::Update,
        Method::DELETE => OperationKind::Delete,
        _ => {
            let path = path.split('?').next().unwrap_or_default().trim_end_matches('/');
            POST_ACTION_KINDS
                .iter()
                .find(|(action, _)| path.ends_with(action))
                .map_or(OperationKind::Create, |&(_, kind)| kind)
        }
    }
}

/// Pages of one listing, fetched through the client's retry and admission path.
struct ListPages {
    client: ApiClient,
    domain: Domain,
    path: String,
    request: ListRequest,
}

#[async_trait]
impl PageSource for ListPages {
    async fn fetch_page(&self, cursor: Option<String>, limit: usize) -> Result<Page, ClientError> {
        let request = self.request.page_request(&self.path, cursor.as_deref(), limit);
        let body = self
            .client
            .execute(self.domain, OperationKind::List, request)
            .await?;
        Page::from_response(body)
    }
}
