//! Entry point that wires the shared sync pieces together.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::{HttpTokenSource, TokenManager, TokenSource};
use crate::cache::collection::CollectionConfig;
use crate::cache::registry::CollectionRegistry;
use crate::config::Config;
use crate::query::{ShapeOptions, ShapeQuery};
use crate::shape::{Params, ShapeDefinition};

/// One authenticated session: a token manager, the collection registry and
/// its sweeper.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct SyncClient {
  tokens: Arc<TokenManager>,
  registry: Arc<CollectionRegistry>,
  sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncClient {
  /// Create a client that gets its access tokens from `source`.
  ///
  /// Must be called from within a tokio runtime; the registry sweeper is
  /// spawned here.
  pub fn new(config: &Config, source: Arc<dyn TokenSource>) -> Result<Self> {
    let base_url = config.base_url()?;
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let tokens = TokenManager::new(source, config.token_ttl());
    let registry = CollectionRegistry::new(
      http,
      Arc::clone(&tokens),
      base_url,
      CollectionConfig::from(config),
      config.gc_grace(),
    );
    let sweeper = registry.spawn_sweeper(config.sweep_interval());

    info!("Sync client ready for {}", config.api.base_url);
    Ok(Self {
      tokens,
      registry,
      sweeper: Arc::new(Mutex::new(Some(sweeper))),
    })
  }

  /// Create a client that fetches tokens from `api.token_url`.
  pub fn from_config(config: &Config) -> Result<Self> {
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    let source = HttpTokenSource::from_config(http, config)?;
    Self::new(config, Arc::new(source))
  }

  /// Subscribe to a shape. Queries for the same table, parameters and
  /// mutation capability share one collection.
  pub fn use_shape(
    &self,
    shape: &ShapeDefinition,
    params: Params,
    options: ShapeOptions,
  ) -> ShapeQuery {
    ShapeQuery::new(Arc::clone(&self.registry), shape.clone(), params, options)
  }

  pub fn tokens(&self) -> &Arc<TokenManager> {
    &self.tokens
  }

  pub fn registry(&self) -> &Arc<CollectionRegistry> {
    &self.registry
  }

  /// Stop the sweeper and dispose every collection.
  pub fn shutdown(&self) {
    let sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(sweeper) = sweeper {
      sweeper.abort();
    }
    self.registry.dispose_all();
    self.tokens.shutdown();
    info!("Sync client shut down");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::StaticTokenSource;
  use crate::shape::stream::{HANDLE_HEADER, OFFSET_HEADER};
  use crate::shape::{params, MutationDefinition};
  use serde_json::json;
  use std::time::Duration;
  use wiremock::matchers::{header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn config(server: &MockServer) -> Config {
    let mut config = Config::new(server.uri());
    config.api.token_url = Some(format!("{}/auth/token", server.uri()));
    config.stream.reconnect_initial_ms = 10;
    config.stream.reconnect_max_ms = 50;
    config
  }

  #[tokio::test]
  async fn test_use_shape_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/auth/token"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "abc"})))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/v1/shape"))
      .and(query_param("offset", "-1"))
      .and(header("authorization", "Bearer abc"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!([
            {"value": {"id": "1", "title": "first"}, "headers": {"operation": "insert"}},
            {"headers": {"control": "up-to-date"}}
          ]))
          .insert_header(HANDLE_HEADER, "h1")
          .insert_header(OFFSET_HEADER, "0_0"),
      )
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/v1/shape"))
      .and(query_param("live", "true"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!([{"headers": {"control": "up-to-date"}}]))
          .set_delay(Duration::from_millis(25)),
      )
      .mount(&server)
      .await;

    let client = SyncClient::from_config(&config(&server)).unwrap();
    let issues = ShapeDefinition::new(
      "issues",
      "/v1/shape?table=issues&where=project_id='{project_id}'",
    );
    let query = client.use_shape(
      &issues,
      params([("project_id", "p1")]),
      ShapeOptions::default(),
    );

    tokio::time::timeout(Duration::from_secs(5), query.ready())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(query.data().len(), 1);
    assert_eq!(query.data()[0]["title"], "first");

    let collection = query.collection().cloned().unwrap();
    client.shutdown();
    assert!(collection.is_disposed());
    assert!(client.registry().is_empty());
  }

  #[tokio::test]
  async fn test_mutations_only_with_definition() {
    let server = MockServer::start().await;
    let client = SyncClient::new(&config(&server), Arc::new(StaticTokenSource::new("t"))).unwrap();
    let issues = ShapeDefinition::new("issues", "/v1/shape?table=issues");

    let read_only = client.use_shape(&issues, Params::new(), ShapeOptions::default());
    let mutable = client.use_shape(
      &issues,
      Params::new(),
      ShapeOptions::default().with_mutation(MutationDefinition::new("/api/issues", "issue")),
    );

    assert!(read_only.mutations().is_none());
    assert!(mutable.mutations().is_some());
    assert_eq!(client.registry().len(), 2);
    client.shutdown();
  }

  #[tokio::test]
  async fn test_invalid_base_url() {
    let config = Config::new("not a url");
    assert!(SyncClient::new(&config, Arc::new(StaticTokenSource::new("t"))).is_err());
  }
}
