use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Method;
use serde_json::Value;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::client::{
    ApiClient, DeleteOptions, ResourceEndpoint, RetrieveOptions, Retrieved, WriteOptions,
};
use crate::identifiers::IdentifierSequence;
use crate::pagination::ListRequest;
use crate::update::UpdateMode;
use crate::{ClientConfig, ClientError};

fn ensure_outside_runtime() -> Result<(), ClientError> {
    if Handle::try_current().is_ok() {
        return Err(ClientError::BlockingInAsyncContext);
    }
    Ok(())
}

/// Blocking client for one project.
///
/// This is the synchronous counterpart of [`crate::ApiClient`]. Every call is
/// driven to completion on a runtime owned by this client, so it must not be
/// used from inside another async runtime.
#[derive(Clone, Debug)]
pub struct BlockingApiClient {
    client: ApiClient,
    runtime: Arc<Runtime>,
}

impl BlockingApiClient {
    /// Creates a client, validating `config` first.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        ensure_outside_runtime()?;
        let client = ApiClient::new(config)?;
        Self::wrap(client)
    }

    /// Drives an existing async client from blocking code.
    pub fn from_async(client: ApiClient) -> Result<Self, ClientError> {
        ensure_outside_runtime()?;
        Self::wrap(client)
    }

    fn wrap(client: ApiClient) -> Result<Self, ClientError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClientError::Runtime)?;
        Ok(Self {
            client,
            runtime: Arc::new(runtime),
        })
    }

    /// The async client behind this one. Clones share admission pools.
    pub fn as_async(&self) -> &ApiClient {
        &self.client
    }

    fn block_on<F, T>(&self, operation: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        ensure_outside_runtime()?;
        self.runtime.block_on(operation)
    }

    /// Sends a `GET` request and parses the response as JSON.
    pub fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        self.block_on(self.client.get_json(path))
    }

    /// Sends a `GET` request with query parameters and parses the response as JSON.
    pub fn get_json_with_query(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        self.block_on(self.client.get_json_with_query(path, query))
    }

    /// Sends a `POST` request with a JSON body and parses the response as JSON.
    pub fn post_json(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.block_on(self.client.post_json(path, body))
    }

    /// Sends a `PUT` request with a JSON body and parses the response as JSON.
    pub fn put_json(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.block_on(self.client.put_json(path, body))
    }

    /// Sends a `DELETE` request and parses the response as JSON.
    pub fn delete_json(&self, path: &str) -> Result<Value, ClientError> {
        self.block_on(self.client.delete_json(path))
    }

    /// Sends a request and parses the response as JSON.
    pub fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.block_on(self.client.request_json(method, path, body))
    }

    /// Sends a request with query parameters and parses the response as JSON.
    ///
    /// Returns [`Value::Null`] for successful responses with an empty body.
    pub fn request_json_with_query(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.block_on(self.client.request_json_with_query(method, path, query, body))
    }

    /// See [`ApiClient::retrieve_multiple`].
    pub fn retrieve_multiple(
        &self,
        endpoint: &ResourceEndpoint,
        ids: &IdentifierSequence,
        options: RetrieveOptions,
    ) -> Result<Retrieved, ClientError> {
        self.block_on(self.client.retrieve_multiple(endpoint, ids, options))
    }

    /// See [`ApiClient::create_multiple`].
    pub fn create_multiple(
        &self,
        endpoint: &ResourceEndpoint,
        items: Vec<Value>,
        options: WriteOptions,
    ) -> Result<Vec<Value>, ClientError> {
        self.block_on(self.client.create_multiple(endpoint, items, options))
    }

    /// See [`ApiClient::update_multiple`].
    pub fn update_multiple(
        &self,
        endpoint: &ResourceEndpoint,
        items: &[Value],
        mode: UpdateMode,
        options: WriteOptions,
    ) -> Result<Vec<Value>, ClientError> {
        self.block_on(self.client.update_multiple(endpoint, items, mode, options))
    }

    /// See [`ApiClient::upsert`].
    pub fn upsert(
        &self,
        endpoint: &ResourceEndpoint,
        items: Vec<Value>,
        mode: UpdateMode,
        options: WriteOptions,
    ) -> Result<Vec<Value>, ClientError> {
        self.block_on(self.client.upsert(endpoint, items, mode, options))
    }

    /// See [`ApiClient::delete_multiple`].
    pub fn delete_multiple(
        &self,
        endpoint: &ResourceEndpoint,
        ids: &IdentifierSequence,
        options: DeleteOptions,
    ) -> Result<(), ClientError> {
        self.block_on(self.client.delete_multiple(endpoint, ids, options))
    }

    /// See [`ApiClient::aggregate`].
    pub fn aggregate(
        &self,
        endpoint: &ResourceEndpoint,
        body: Value,
    ) -> Result<Vec<Value>, ClientError> {
        self.block_on(self.client.aggregate(endpoint, body))
    }

    /// See [`ApiClient::list`].
    pub fn list(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
    ) -> Result<Vec<Value>, ClientError> {
        self.block_on(self.client.list(endpoint, request))
    }

    /// See [`ApiClient::list_partitioned`].
    pub fn list_partitioned(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
        partitions: usize,
    ) -> Result<Vec<Value>, ClientError> {
        self.block_on(self.client.list_partitioned(endpoint, request, partitions))
    }

    /// Blocking iterator over listed items. See [`ApiClient::list_stream`].
    pub fn list_iter(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
    ) -> BlockingStream<Value> {
        BlockingStream::new(
            Arc::clone(&self.runtime),
            self.client.list_stream(endpoint, request),
        )
    }

    /// Blocking iterator over chunks of listed items. See [`ApiClient::list_chunks`].
    pub fn list_chunks_iter(
        &self,
        endpoint: &ResourceEndpoint,
        request: ListRequest,
        chunk_size: usize,
    ) -> BlockingStream<Vec<Value>> {
        BlockingStream::new(
            Arc::clone(&self.runtime),
            self.client.list_chunks(endpoint, request, chunk_size),
        )
    }
}

/// Iterator that pulls one element at a time from an async stream.
///
/// Nothing runs between calls to `next`. Dropping the iterator drops the
/// stream, so no further page is requested.
pub struct BlockingStream<T> {
    runtime: Arc<Runtime>,
    stream: Option<BoxStream<'static, Result<T, ClientError>>>,
}

impl<T> BlockingStream<T> {
    fn new(runtime: Arc<Runtime>, stream: BoxStream<'static, Result<T, ClientError>>) -> Self {
        Self {
            runtime,
            stream: Some(stream),
        }
    }
}

impl<T> Iterator for BlockingStream<T> {
    type Item = Result<T, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        let stream = self.stream.as_mut()?;
        if let Err(error) = ensure_outside_runtime() {
            self.stream = None;
            return Some(Err(error));
        }
        let next = self.runtime.block_on(stream.next());
        if next.is_none() {
            self.stream = None;
        }
        next
    }
}

impl<T> std::fmt::Debug for BlockingStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingStream")
            .field("exhausted", &self.stream.is_none())
            .finish_non_exhaustive()
    }
}
