//! Network side of optimistic writes.
//!
//! `MutationHandlers` turns staged changes into authenticated requests
//! against a mutation endpoint and hands back the server's transaction ids.
//! Waiting for those ids to appear in the change-stream is the collection's
//! job.

use futures::future::join_all;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::auth::TokenManager;
use crate::error::{error_from_response, SyncError, SyncResult};
use crate::shape::{resolve_url, MutationDefinition, Row, Txid};

/// One write sent to the mutation endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRequest {
  Insert(Row),
  Update { key: String, changes: Row },
  Delete { key: String },
}

#[derive(Debug, Deserialize)]
struct TxidResponse {
  txid: TxidField,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TxidField {
  One(Txid),
  Many(Vec<Txid>),
  Text(String),
}

impl TxidField {
  fn into_txids(self) -> SyncResult<Vec<Txid>> {
    match self {
      Self::One(txid) => Ok(vec![txid]),
      Self::Many(txids) => Ok(txids),
      Self::Text(raw) => raw
        .parse()
        .map(|txid| vec![txid])
        .map_err(|_| SyncError::new(format!("Invalid txid '{}' in mutation response", raw))),
    }
  }
}

/// Insert/update/delete operations for one mutation endpoint.
#[derive(Clone)]
pub struct MutationHandlers {
  http: reqwest::Client,
  tokens: Arc<TokenManager>,
  url: Url,
  name: String,
}

impl MutationHandlers {
  pub fn new(
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    base_url: &Url,
    definition: &MutationDefinition,
  ) -> SyncResult<Self> {
    Ok(Self {
      http,
      tokens,
      url: resolve_url(base_url, &definition.url)?,
      name: definition.name.clone(),
    })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// `POST` each row. Results are per row, in order.
  pub async fn on_insert(&self, rows: &[Row]) -> Vec<SyncResult<Vec<Txid>>> {
    let requests: Vec<MutationRequest> = rows.iter().cloned().map(MutationRequest::Insert).collect();
    self.dispatch(&requests).await
  }

  /// `PATCH {url}/{key}` with only the changed fields.
  pub async fn on_update(&self, updates: &[(String, Row)]) -> Vec<SyncResult<Vec<Txid>>> {
    let requests: Vec<MutationRequest> = updates
      .iter()
      .map(|(key, changes)| MutationRequest::Update {
        key: key.clone(),
        changes: changes.clone(),
      })
      .collect();
    self.dispatch(&requests).await
  }

  /// `DELETE {url}/{key}`.
  pub async fn on_delete(&self, keys: &[String]) -> Vec<SyncResult<Vec<Txid>>> {
    let requests: Vec<MutationRequest> = keys
      .iter()
      .map(|key| MutationRequest::Delete { key: key.clone() })
      .collect();
    self.dispatch(&requests).await
  }

  /// Send every request concurrently. One failure doesn't affect the others.
  pub async fn dispatch(&self, requests: &[MutationRequest]) -> Vec<SyncResult<Vec<Txid>>> {
    join_all(requests.iter().map(|request| self.send(request))).await
  }

  async fn send(&self, request: &MutationRequest) -> SyncResult<Vec<Txid>> {
    let (builder, fallback) = match request {
      MutationRequest::Insert(row) => (
        self.http.post(self.url.clone()).json(row),
        format!("Failed to create {}", self.name),
      ),
      MutationRequest::Update { key, changes } => (
        self.http.patch(self.row_url(key)?).json(changes),
        format!("Failed to update {}", self.name),
      ),
      MutationRequest::Delete { key } => (
        self.http.delete(self.row_url(key)?),
        format!("Failed to delete {}", self.name),
      ),
    };

    let builder = match self.tokens.get_token().await {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    };

    let response = builder
      .send()
      .await
      .map_err(|e| SyncError::new(format!("{}: {}", fallback, e)))?;

    if !response.status().is_success() {
      let err = error_from_response(response, &fallback).await;
      warn!("{} rejected: {}", self.name, err);
      return Err(err);
    }

    let body: TxidResponse = response
      .json()
      .await
      .map_err(|e| SyncError::new(format!("Invalid mutation response: {}", e)))?;
    let txids = body.txid.into_txids()?;
    debug!("{} mutation accepted with txids {:?}", self.name, txids);

    Ok(txids)
  }

  fn row_url(&self, key: &str) -> SyncResult<Url> {
    let url = format!(
      "{}/{}",
      self.url.as_str().trim_end_matches('/'),
      urlencoding::encode(key)
    );
    Url::parse(&url).map_err(|e| SyncError::new(format!("Invalid url '{}': {}", url, e)))
  }
}

/// Resolves once a mutation is confirmed by the change-stream, or fails
/// when the server rejected it.
///
/// The mutation itself runs on a background task, so dropping this future
/// does not cancel the write.
#[must_use = "a Persisted does nothing unless awaited, but the write still happens"]
pub struct Persisted<T> {
  rx: oneshot::Receiver<SyncResult<T>>,
}

impl<T> Persisted<T> {
  /// A value that is already settled.
  pub fn ready(value: SyncResult<T>) -> Self {
    let (tx, persisted) = Self::channel();
    let _ = tx.send(value);
    persisted
  }

  pub(crate) fn channel() -> (oneshot::Sender<SyncResult<T>>, Self) {
    let (tx, rx) = oneshot::channel();
    (tx, Self { rx })
  }
}

impl<T> Future for Persisted<T> {
  type Output = SyncResult<T>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.rx).poll(cx).map(|result| {
      result.unwrap_or_else(|_| Err(SyncError::new("Mutation was abandoned before it settled")))
    })
  }
}
