use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::ClientError;
use crate::http::ApiRequest;

/// One page of a cursor-paginated listing.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Value>,
    /// Continuation token. `None` or empty means there are no more pages.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl Page {
    /// Reads `items` and `nextCursor` from a list response.
    pub fn from_response(body: Value) -> Result<Self, ClientError> {
        let mut page: Self = serde_json::from_value(body)?;
        page.next_cursor = page.next_cursor.filter(|cursor| !cursor.is_empty());
        Ok(page)
    }
}

/// Something that can fetch one page given a cursor and a page size.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, cursor: Option<String>, limit: usize) -> Result<Page, ClientError>;
}

/// Parameters of a listing call.
#[derive(Clone, Debug)]
pub struct ListRequest {
    /// `GET` sends parameters as query string, `POST` as JSON body.
    pub method: Method,
    pub filter: Option<Value>,
    /// Extra parameters sent with every page.
    pub params: Map<String, Value>,
    /// Stop after this many items in total.
    pub limit: Option<usize>,
    /// Start from a cursor returned by an earlier listing.
    pub cursor: Option<String>,
    /// Parallel-retrieval partition, rendered as `"i/n"`.
    pub partition: Option<(usize, usize)>,
}

impl ListRequest {
    pub fn get() -> Self {
        Self::with_method(Method::GET)
    }

    pub fn post() -> Self {
        Self::with_method(Method::POST)
    }

    fn with_method(method: Method) -> Self {
        Self {
            method,
            filter: None,
            params: Map::new(),
            limit: None,
            cursor: None,
            partition: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Request for one page at `path`.
    pub fn page_request(&self, path: &str, cursor: Option<&str>, limit: usize) -> ApiRequest {
        let partition = self
            .partition
            .map(|(index, total)| format!("{index}/{total}"));

        if self.method == Method::POST {
            let mut body = self.params.clone();
            if let Some(filter) = &self.filter {
                body.insert("filter".to_owned(), filter.clone());
            }
            body.insert("limit".to_owned(), json!(limit));
            if let Some(cursor) = cursor {
                body.insert("cursor".to_owned(), json!(cursor));
            }
            if let Some(partition) = partition {
                body.insert("partition".to_owned(), json!(partition));
            }
            return ApiRequest::new(Method::POST, path).with_body(Value::Object(body));
        }

        let mut request = ApiRequest::new(self.method.clone(), path);
        let filter_params = self
            .filter
            .as_ref()
            .and_then(Value::as_object)
            .into_iter()
            .flatten();
        for (key, value) in self.params.iter().chain(filter_params) {
            request = request.with_query(key.as_str(), query_value(value));
        }
        request = request.with_query("limit", limit.to_string());
        if let Some(cursor) = cursor {
            request = request.with_query("cursor", cursor);
        }
        if let Some(partition) = partition {
            request = request.with_query("partition", partition);
        }
        request
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

struct PageState {
    source: Arc<dyn PageSource>,
    cursor: Option<String>,
    fetched: usize,
    limit: Option<usize>,
    page_size: usize,
    done: bool,
}

/// Lazily fetches pages, following cursors until none is returned or `limit` items were read.
///
/// No page is requested until the stream is polled past the previous one.
pub fn page_stream(
    source: Arc<dyn PageSource>,
    page_size: usize,
    limit: Option<usize>,
    cursor: Option<String>,
) -> BoxStream<'static, Result<Vec<Value>, ClientError>> {
    let state = PageState {
        source,
        cursor,
        fetched: 0,
        limit,
        page_size: page_size.max(1),
        done: false,
    };

    stream::try_unfold(state, |mut state| async move {
        let remaining = state
            .limit
            .map_or(usize::MAX, |limit| limit.saturating_sub(state.fetched));
        if state.done || remaining == 0 {
            return Ok(None);
        }

        let request_size = state.page_size.min(remaining);
        let page = state
            .source
            .fetch_page(state.cursor.take(), request_size)
            .await?;

        let mut items = page.items;
        items.truncate(remaining);
        state.fetched += items.len();
        state.cursor = page.next_cursor.filter(|cursor| !cursor.is_empty());
        state.done = state.cursor.is_none();
        debug!(fetched = state.fetched, more = !state.done, "page received");

        Ok::<_, ClientError>(Some((items, state)))
    })
    .boxed()
}

/// Items of [`page_stream`] one at a time.
pub fn item_stream(
    source: Arc<dyn PageSource>,
    page_size: usize,
    limit: Option<usize>,
    cursor: Option<String>,
) -> BoxStream<'static, Result<Value, ClientError>> {
    page_stream(source, page_size, limit, cursor)
        .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
}

struct ChunkState {
    pages: BoxStream<'static, Result<Vec<Value>, ClientError>>,
    buffer: Vec<Value>,
    exhausted: bool,
}

/// Items of [`page_stream`] regrouped into chunks of exactly `chunk_size`.
///
/// The last chunk holds whatever is left and may be smaller. Nothing is
/// yielded after an error.
pub fn chunk_stream(
    source: Arc<dyn PageSource>,
    page_size: usize,
    chunk_size: usize,
    limit: Option<usize>,
    cursor: Option<String>,
) -> BoxStream<'static, Result<Vec<Value>, ClientError>> {
    let chunk_size = chunk_size.max(1);
    let state = ChunkState {
        pages: page_stream(source, page_size, limit, cursor),
        buffer: Vec::new(),
        exhausted: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if state.buffer.len() >= chunk_size {
                let rest = state.buffer.split_off(chunk_size);
                let chunk = std::mem::replace(&mut state.buffer, rest);
                return Some((Ok(chunk), state));
            }
            if state.exhausted {
                if state.buffer.is_empty() {
                    return None;
                }
                let chunk = std::mem::take(&mut state.buffer);
                return Some((Ok(chunk), state));
            }
            match state.pages.next().await {
                Some(Ok(items)) => state.buffer.extend(items),
                Some(Err(error)) => {
                    state.exhausted = true;
                    state.buffer.clear();
                    return Some((Err(error), state));
                }
                None => state.exhausted = true,
            }
        }
    })
    .boxed()
}
