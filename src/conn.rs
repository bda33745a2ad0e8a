//! REST connection to a Lires server.
//!
//! Every request carries the auth token: GET requests as the `key` query
//! parameter, POST requests as the `key` form field. Non-success statuses
//! become [`Error::Status`]; anything that prevents a response from arriving
//! becomes [`Error::Transport`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use lires_client_core::models::DocumentRecord;
use lires_client_core::search::{RemoteHits, RemoteSearch, SearchField};
use lires_client_core::stream::{parse_total, TOTAL_COUNT_HEADER};
use lires_client_core::tags::TagSet;
use lires_client_core::{Error, Result};
use reqwest::{Client, Response};
use tracing::debug;

use crate::config::ServerConfig;

/// Raw body chunks of a streaming response.
pub type ByteStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Separator between tags in the `tags` query parameter.
const TAG_QUERY_SEP: &str = "&&";

/// Result cap passed to the server's feature search.
const FEATURE_SEARCH_LIMIT: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplementKind {
    Note,
    Abstract,
}

impl SupplementKind {
    fn as_str(self) -> &'static str {
        match self {
            SupplementKind::Note => "note",
            SupplementKind::Abstract => "abstract",
        }
    }
}

#[derive(Clone)]
pub struct ServerConn {
    client: Client,
    backend: String,
    key: String,
}

fn transport(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

fn tags_query(tags: &TagSet) -> String {
    tags.sorted().join(TAG_QUERY_SEP)
}

impl ServerConn {
    pub fn new(backend: impl Into<String>, key: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(Self {
            client: builder.build().map_err(transport)?,
            backend: backend.into().trim_end_matches('/').to_string(),
            key: key.into(),
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(&config.url, config.resolved_key(), Some(config.timeout()))
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.backend, path)
    }

    fn check(path: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        debug!(endpoint = path, status = status.as_u16(), "request failed");
        Err(Error::Status {
            status: status.as_u16(),
            endpoint: path.to_string(),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Response> {
        let response = self
            .client
            .get(self.url(path))
            .query(&[("key", self.key.as_str())])
            .query(query)
            .send()
            .await
            .map_err(transport)?;
        Self::check(path, response)
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Response> {
        let mut fields: Vec<(&str, &str)> = vec![("key", self.key.as_str())];
        fields.extend_from_slice(form);
        let response = self
            .client
            .post(self.url(path))
            .form(&fields)
            .send()
            .await
            .map_err(transport)?;
        Self::check(path, response)
    }

    /// One-shot list of every summary matching `tags`.
    pub async fn file_list(&self, tags: &TagSet) -> Result<Vec<DocumentRecord>> {
        let query = tags_query(tags);
        let body: serde_json::Value = self
            .get("/filelist", &[("tags", query.as_str())])
            .await?
            .json()
            .await
            .map_err(transport)?;
        // Older servers wrap the list as `{"data": [...]}`.
        let list = match body {
            serde_json::Value::Object(mut obj) => obj.remove("data").unwrap_or_default(),
            other => other,
        };
        Ok(serde_json::from_value(list)?)
    }

    /// Open the record stream. Returns the declared total (if the server
    /// sent one) and the raw body chunks.
    pub async fn file_list_stream(&self, tags: &TagSet) -> Result<(Option<u64>, ByteStream)> {
        let query = tags_query(tags);
        let response = self.get("/filelist-stream", &[("tags", query.as_str())]).await?;
        let total = parse_total(
            response
                .headers()
                .get(TOTAL_COUNT_HEADER)
                .and_then(|v| v.to_str().ok()),
        );
        Ok((total, response.bytes_stream().boxed()))
    }

    pub async fn summary(&self, id: &str) -> Result<DocumentRecord> {
        let path = format!("/fileinfo/{}", id);
        self.get(&path, &[]).await?.json().await.map_err(transport)
    }

    pub async fn supplement(&self, kind: SupplementKind, id: &str) -> Result<String> {
        let path = format!("/fileinfo-supp/{}/{}", kind.as_str(), id);
        self.get(&path, &[]).await?.text().await.map_err(transport)
    }

    pub async fn update_supplement(&self, kind: SupplementKind, id: &str, content: &str) -> Result<()> {
        let path = format!("/fileinfo-supp/{}-update/{}", kind.as_str(), id);
        self.post_form(&path, &[("content", content)]).await?;
        Ok(())
    }

    pub async fn reload_db(&self) -> Result<()> {
        self.post_form("/reload-db", &[]).await?;
        Ok(())
    }

    pub async fn rename_tag(&self, old_tag: &str, new_tag: &str) -> Result<()> {
        self.post_form("/dataman/tag-rename", &[("oldTag", old_tag), ("newTag", new_tag)])
            .await?;
        Ok(())
    }

    pub async fn delete_tag(&self, tag: &str) -> Result<()> {
        self.post_form("/dataman/tag-delete", &[("tag", tag)]).await?;
        Ok(())
    }

    /// Raw `/search` call: `method` names the server-side searcher.
    pub async fn search_raw(&self, method: &str, kwargs: &serde_json::Value) -> Result<serde_json::Value> {
        let kwargs = serde_json::to_string(kwargs)?;
        self.post_form("/search", &[("method", method), ("kwargs", kwargs.as_str())])
            .await?
            .json()
            .await
            .map_err(transport)
    }
}

/// Server-side searcher name and arguments for a remote selector.
fn remote_method(field: SearchField, pattern: &str) -> Result<(&'static str, serde_json::Value)> {
    match field {
        SearchField::Feature => Ok((
            "searchFeature",
            serde_json::json!({ "pattern": pattern, "n_return": FEATURE_SEARCH_LIMIT }),
        )),
        SearchField::Note => Ok(("searchNote", serde_json::json!({ "pattern": pattern }))),
        other => Err(Error::InvalidArgument(format!(
            "selector {} is evaluated locally",
            other
        ))),
    }
}

/// Decode a `/search` reply: an object mapping id to `{score, match}` or
/// `null`. Scores are kept only when `scored`; missing scores count as 0.
pub fn parse_search_reply(reply: serde_json::Value, scored: bool) -> Result<RemoteHits> {
    let serde_json::Value::Object(entries) = reply else {
        return Err(Error::InvalidArgument(
            "search reply is not a JSON object".to_string(),
        ));
    };
    let mut ids = Vec::with_capacity(entries.len());
    let mut scores = Vec::with_capacity(entries.len());
    for (id, hit) in entries {
        let score = hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
        ids.push(id);
        scores.push(score);
    }
    Ok(RemoteHits {
        ids,
        scores: scored.then_some(scores),
    })
}

#[async_trait]
impl RemoteSearch for ServerConn {
    async fn search(&self, field: SearchField, pattern: &str) -> Result<RemoteHits> {
        let (method, kwargs) = remote_method(field, pattern)?;
        let reply = self.search_raw(method, &kwargs).await?;
        parse_search_reply(reply, field == SearchField::Feature)
    }
}
