//! Consumer-facing view of a shape.
//!
//! `ShapeQuery` holds a lease on a shared collection and exposes its rows,
//! loading and error state, and the optimistic write API when the shape was
//! requested with a mutation endpoint.
//!
//! # Example
//!
//! ```ignore
//! let issues = ShapeDefinition::new("issues", "/v1/shape?table=issues&where=project_id='{project_id}'");
//! let mut query = client.use_shape(
//!   &issues,
//!   params([("project_id", "p1")]),
//!   ShapeOptions::default().with_mutation(MutationDefinition::new("/api/issues", "issue")),
//! );
//!
//! query.ready().await?;
//! let Inserted { data, persisted } = query.mutations().unwrap().insert(row);
//! // `data` is visible in `query.data()` right away
//! let confirmed = persisted.await?;
//! ```

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::collection::Collection;
use crate::cache::registry::{CollectionLease, CollectionRegistry};
use crate::error::{SyncError, SyncResult};
use crate::mutation::Persisted;
use crate::shape::{MutationDefinition, Params, Row, ShapeDefinition};

/// How a shape is subscribed to.
#[derive(Debug, Clone)]
pub struct ShapeOptions {
  /// A disabled query has no collection and never fetches
  pub enabled: bool,
  pub mutation: Option<MutationDefinition>,
}

impl Default for ShapeOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      mutation: None,
    }
  }
}

impl ShapeOptions {
  pub fn with_mutation(mut self, mutation: MutationDefinition) -> Self {
    self.mutation = Some(mutation);
    self
  }

  pub fn disabled(mut self) -> Self {
    self.enabled = false;
    self
  }
}

/// A subscription to one shape.
///
/// Dropping it releases the collection; the registry keeps it warm for the
/// grace period so a quick re-subscribe reuses the synced rows.
pub struct ShapeQuery {
  registry: Arc<CollectionRegistry>,
  shape: ShapeDefinition,
  params: Params,
  options: ShapeOptions,
  lease: Option<CollectionLease>,
  updates: Option<watch::Receiver<u64>>,
  /// Failure to set up the collection at all (e.g. a missing parameter)
  error: Option<SyncError>,
  mutations: Option<ShapeMutations>,
}

impl ShapeQuery {
  pub(crate) fn new(
    registry: Arc<CollectionRegistry>,
    shape: ShapeDefinition,
    params: Params,
    options: ShapeOptions,
  ) -> Self {
    let mut query = Self {
      registry,
      shape,
      params,
      options,
      lease: None,
      updates: None,
      error: None,
      mutations: None,
    };
    query.subscribe();
    query
  }

  fn subscribe(&mut self) {
    if self.options.enabled {
      match self
        .registry
        .acquire(&self.shape, &self.params, self.options.mutation.as_ref())
      {
        Ok(lease) => {
          lease.collection().start();
          self.updates = Some(lease.collection().subscribe());
          self.lease = Some(lease);
          self.error = None;
        }
        Err(err) => self.error = Some(err),
      }
    }

    self.mutations = self.options.mutation.as_ref().map(|_| ShapeMutations {
      collection: self.lease.as_ref().map(|lease| Arc::clone(lease.collection())),
    });
  }

  /// The shared collection behind this query, if enabled.
  pub fn collection(&self) -> Option<&Arc<Collection>> {
    self.lease.as_ref().map(CollectionLease::collection)
  }

  /// Visible rows: synced plus pending optimistic changes.
  pub fn data(&self) -> Vec<Row> {
    self.collection().map(|c| c.rows()).unwrap_or_default()
  }

  /// True until the first complete snapshot arrives.
  pub fn is_loading(&self) -> bool {
    match self.collection() {
      Some(collection) => !collection.is_ready() && collection.error().is_none(),
      None => false,
    }
  }

  pub fn error(&self) -> Option<SyncError> {
    if let Some(err) = &self.error {
      return Some(err.clone());
    }
    self.collection().and_then(|c| c.error())
  }

  /// Clear the error and re-read the shape from scratch.
  pub fn retry(&mut self) {
    match self.collection() {
      Some(collection) => {
        collection.clear_error();
        collection.restart();
      }
      None => self.subscribe(),
    }
  }

  /// Wait for the next change to the visible state. Returns false when
  /// there is nothing to wait on (disabled, or the collection is gone).
  pub async fn changed(&mut self) -> bool {
    match self.updates.as_mut() {
      Some(updates) => updates.changed().await.is_ok(),
      None => false,
    }
  }

  /// Wait for the initial snapshot. A disabled query is ready immediately.
  pub async fn ready(&self) -> SyncResult<()> {
    if let Some(err) = &self.error {
      return Err(err.clone());
    }
    match self.collection() {
      Some(collection) => collection.ready().await,
      None => Ok(()),
    }
  }

  /// Write operations, when the query was created with a mutation endpoint.
  pub fn mutations(&self) -> Option<&ShapeMutations> {
    self.mutations.as_ref()
  }
}

/// Result of an optimistic insert.
#[must_use]
pub struct Inserted {
  /// The row as applied locally, id included
  pub data: Row,
  /// Resolves to the server's version of the row once confirmed
  pub persisted: Persisted<Row>,
}

/// Optimistic writes for one shape.
#[derive(Clone)]
pub struct ShapeMutations {
  /// `None` for a disabled query: writes resolve immediately and do nothing
  collection: Option<Arc<Collection>>,
}

impl ShapeMutations {
  pub fn insert(&self, data: Row) -> Inserted {
    let mut inserted = self.insert_many(vec![data]);
    match inserted.pop() {
      Some(inserted) => inserted,
      None => Inserted {
        data: Row::new(),
        persisted: Persisted::ready(Err(SyncError::new("Insert produced no result"))),
      },
    }
  }

  /// Insert several rows with one batch. Each row settles on its own.
  pub fn insert_many(&self, rows: Vec<Row>) -> Vec<Inserted> {
    let rows: Vec<Row> = rows.into_iter().map(with_id).collect();

    let Some(collection) = &self.collection else {
      return rows
        .into_iter()
        .map(|data| Inserted {
          persisted: Persisted::ready(Ok(data.clone())),
          data,
        })
        .collect();
    };

    let persisted = collection.insert(rows.clone());
    rows
      .into_iter()
      .zip(persisted)
      .map(|(data, persisted)| Inserted { data, persisted })
      .collect()
  }

  /// Apply `changes` to the row with this id.
  pub fn update(&self, id: &str, changes: Row) -> Persisted<()> {
    match &self.collection {
      Some(collection) => collection.update(id, changes),
      None => Persisted::ready(Ok(())),
    }
  }

  pub fn remove(&self, id: &str) -> Persisted<()> {
    match &self.collection {
      Some(collection) => collection.delete(id),
      None => Persisted::ready(Ok(())),
    }
  }
}

fn with_id(mut row: Row) -> Row {
  if !row.contains_key("id") {
    row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
  }
  row
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::{StaticTokenSource, TokenManager};
  use crate::cache::collection::CollectionConfig;
  use crate::shape::params;
  use crate::shape::stream::{HANDLE_HEADER, OFFSET_HEADER};
  use serde_json::json;
  use std::time::Duration;
  use url::Url;
  use wiremock::matchers::{body_partial_json, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
  }

  fn registry(server: &MockServer) -> Arc<CollectionRegistry> {
    let tokens = TokenManager::new(Arc::new(StaticTokenSource::new("t")), Duration::from_secs(125));
    CollectionRegistry::new(
      reqwest::Client::new(),
      tokens,
      Url::parse(&server.uri()).unwrap(),
      CollectionConfig {
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..CollectionConfig::default()
      },
      Duration::from_secs(300),
    )
  }

  fn issues() -> ShapeDefinition {
    ShapeDefinition::new("issues", "/v1/shape?table=issues&where=project_id='{project_id}'")
  }

  fn mutable() -> ShapeOptions {
    ShapeOptions::default().with_mutation(MutationDefinition::new("/api/issues", "issue"))
  }

  /// Empty snapshot, then live polls that keep returning `live`.
  async fn mount_shape(server: &MockServer, live: Value) {
    Mock::given(method("GET"))
      .and(path("/v1/shape"))
      .and(query_param("offset", "-1"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!([{"headers": {"control": "up-to-date"}}]))
          .insert_header(HANDLE_HEADER, "h1")
          .insert_header(OFFSET_HEADER, "0_0"),
      )
      .mount(server)
      .await;
    Mock::given(method("GET"))
      .and(path("/v1/shape"))
      .and(query_param("live", "true"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(live)
          .insert_header(OFFSET_HEADER, "1_0")
          .set_delay(Duration::from_millis(25)),
      )
      .mount(server)
      .await;
  }

  fn query(registry: &Arc<CollectionRegistry>, options: ShapeOptions) -> ShapeQuery {
    ShapeQuery::new(
      Arc::clone(registry),
      issues(),
      params([("project_id", "p1")]),
      options,
    )
  }

  #[tokio::test]
  async fn test_read_only_query_has_no_mutations() {
    let server = MockServer::start().await;
    mount_shape(&server, json!([{"headers": {"control": "up-to-date"}}])).await;
    let registry = registry(&server);

    let query = query(&registry, ShapeOptions::default());
    assert!(query.is_loading());
    query.ready().await.unwrap();

    assert!(query.mutations().is_none());
    assert!(!query.is_loading());
    assert!(query.data().is_empty());
  }

  #[tokio::test]
  async fn test_insert_posts_and_resolves_to_server_row() {
    let server = MockServer::start().await;
    mount_shape(
      &server,
      json!([
        {
          "value": {"id": "row-1", "title": "hello", "number": 7},
          "headers": {"operation": "insert", "txids": [42]}
        },
        {"headers": {"control": "up-to-date"}}
      ]),
    )
    .await;
    Mock::given(method("POST"))
      .and(path("/api/issues"))
      .and(body_partial_json(json!({"id": "row-1", "title": "hello"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"txid": 42})))
      .expect(1)
      .mount(&server)
      .await;
    let registry = registry(&server);
    let query = query(&registry, mutable());
    query.ready().await.unwrap();

    let inserted = query
      .mutations()
      .unwrap()
      .insert(row(json!({"id": "row-1", "title": "hello"})));
    assert_eq!(query.data(), vec![inserted.data.clone()]);

    let confirmed = tokio::time::timeout(Duration::from_secs(5), inserted.persisted)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(confirmed, row(json!({"id": "row-1", "title": "hello", "number": 7})));
    assert_eq!(query.data(), vec![confirmed]);
  }

  #[tokio::test]
  async fn test_insert_generates_id() {
    let server = MockServer::start().await;
    mount_shape(&server, json!([{"headers": {"control": "up-to-date"}}])).await;
    Mock::given(method("POST"))
      .and(path("/api/issues"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"txid": 5})))
      .mount(&server)
      .await;
    let registry = registry(&server);
    let query = query(&registry, mutable());
    query.ready().await.unwrap();

    let inserted = query.mutations().unwrap().insert(row(json!({"title": "no id"})));
    let id = inserted.data["id"].as_str().unwrap().to_string();

    assert!(Uuid::parse_str(&id).is_ok());
    assert_eq!(query.collection().unwrap().get(&id), Some(inserted.data.clone()));
  }

  #[tokio::test]
  async fn test_rejected_insert_rolls_back() {
    let server = MockServer::start().await;
    mount_shape(&server, json!([{"headers": {"control": "up-to-date"}}])).await;
    Mock::given(method("POST"))
      .and(path("/api/issues"))
      .respond_with(
        ResponseTemplate::new(422)
          .set_body_json(json!({"message": "title is required"}))
          .set_delay(Duration::from_millis(20)),
      )
      .mount(&server)
      .await;
    let registry = registry(&server);
    let query = query(&registry, mutable());
    query.ready().await.unwrap();

    let inserted = query.mutations().unwrap().insert(row(json!({"id": "a"})));
    assert_eq!(query.data().len(), 1);

    let err = inserted.persisted.await.unwrap_err();
    assert_eq!(err, SyncError::with_status(422, "title is required"));
    assert!(query.data().is_empty());
  }

  #[tokio::test]
  async fn test_insert_many_settles_per_row() {
    let server = MockServer::start().await;
    mount_shape(
      &server,
      json!([
        {"value": {"id": "good"}, "headers": {"operation": "insert", "txids": [1]}},
        {"headers": {"control": "up-to-date"}}
      ]),
    )
    .await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({"id": "good"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"txid": 1})))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({"id": "bad"})))
      .respond_with(ResponseTemplate::new(400).set_body_json(json!({})))
      .mount(&server)
      .await;
    let registry = registry(&server);
    let query = query(&registry, mutable());
    query.ready().await.unwrap();

    let mut inserted = query
      .mutations()
      .unwrap()
      .insert_many(vec![row(json!({"id": "good"})), row(json!({"id": "bad"}))]);
    let bad = inserted.pop().unwrap();
    let good = inserted.pop().unwrap();

    assert_eq!(
      bad.persisted.await,
      Err(SyncError::with_status(400, "Failed to create issue"))
    );
    assert_eq!(good.persisted.await, Ok(row(json!({"id": "good"}))));
  }

  #[tokio::test]
  async fn test_disabled_query_resolves_immediately() {
    let server = MockServer::start().await;
    let registry = registry(&server);

    let query = query(&registry, mutable().disabled());

    assert!(query.collection().is_none());
    assert!(!query.is_loading());
    query.ready().await.unwrap();

    let mutations = query.mutations().unwrap();
    let inserted = mutations.insert(row(json!({"id": "x"})));
    assert_eq!(inserted.persisted.await, Ok(row(json!({"id": "x"}))));
    assert_eq!(mutations.remove("x").await, Ok(()));
    assert!(registry.is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_missing_param_surfaces_as_error() {
    let server = MockServer::start().await;
    let registry = registry(&server);

    let mut query = ShapeQuery::new(
      Arc::clone(&registry),
      issues(),
      Params::new(),
      ShapeOptions::default(),
    );

    assert!(query.error().unwrap().message.contains("project_id"));
    assert!(query.ready().await.is_err());
    assert!(!query.changed().await);
  }

  #[tokio::test]
  async fn test_retry_clears_error_and_refetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/v1/shape"))
      .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "boom"})))
      .with_priority(10)
      .mount(&server)
      .await;
    let registry = registry(&server);
    let mut query = query(&registry, ShapeOptions::default());

    while query.error().is_none() {
      assert!(query.changed().await);
    }
    assert_eq!(query.error().unwrap().message, "boom");

    // Takes precedence over the failing mock from now on
    mount_shape(&server, json!([{"headers": {"control": "up-to-date"}}])).await;
    query.retry();
    assert_eq!(query.error(), None);

    tokio::time::timeout(Duration::from_secs(5), query.ready())
      .await
      .unwrap()
      .unwrap();
    let requests = server.received_requests().await.unwrap();
    assert!(requests
      .iter()
      .any(|r| r.url.query_pairs().any(|(k, _)| k == "cache-buster")));
  }

  #[tokio::test]
  async fn test_queries_share_a_collection() {
    let server = MockServer::start().await;
    mount_shape(&server, json!([{"headers": {"control": "up-to-date"}}])).await;
    let registry = registry(&server);

    let a = query(&registry, ShapeOptions::default());
    let b = query(&registry, ShapeOptions::default());

    assert!(Arc::ptr_eq(a.collection().unwrap(), b.collection().unwrap()));
    assert_eq!(registry.len(), 1);
  }
}
