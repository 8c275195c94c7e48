//! Process-wide registry of live collections.
//!
//! Every caller asking for the same table, parameters and mutation
//! capability shares one `Collection`. Collections nobody holds a lease on
//! are kept around for a grace period and then swept.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use super::collection::{Collection, CollectionConfig};
use crate::auth::TokenManager;
use crate::error::SyncResult;
use crate::mutation::MutationHandlers;
use crate::shape::{resolve_url, MutationDefinition, Params, ShapeDefinition};

// ============================================================================
// Identity
// ============================================================================

/// Cache key of a collection: `{table}:{name}={value}&...` plus `:mutable`
/// when the collection carries mutation handlers.
///
/// Pairs are ordered by parameter name so the order the caller supplied
/// them in doesn't matter. Names and values are percent-encoded, so no two
/// parameter sets render to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(String);

impl CollectionId {
  pub fn new<I, K, V>(table: &str, params: I, has_mutations: bool) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
  {
    let mut pairs: Vec<(K, V)> = params.into_iter().collect();
    pairs.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));

    let query: Vec<String> = pairs
      .iter()
      .map(|(k, v)| format!("{}={}", urlencoding::encode(k.as_ref()), urlencoding::encode(v.as_ref())))
      .collect();
    let mut id = format!("{}:{}", table, query.join("&"));
    if has_mutations {
      id.push_str(":mutable");
    }
    Self(id)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CollectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ============================================================================
// Registry
// ============================================================================

struct Entry {
  collection: Arc<Collection>,
  subscribers: usize,
  /// When the last subscriber went away
  detached_at: Option<Instant>,
}

pub struct CollectionRegistry {
  http: reqwest::Client,
  tokens: Arc<TokenManager>,
  base_url: Url,
  config: CollectionConfig,
  gc_grace: Duration,
  entries: Mutex<HashMap<CollectionId, Entry>>,
}

impl CollectionRegistry {
  pub fn new(
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    base_url: Url,
    config: CollectionConfig,
    gc_grace: Duration,
  ) -> Arc<Self> {
    Arc::new(Self {
      http,
      tokens,
      base_url,
      config,
      gc_grace,
      entries: Mutex::new(HashMap::new()),
    })
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<CollectionId, Entry>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// The shared collection for this shape, created on first use.
  ///
  /// Creation does not start syncing. A fresh collection nobody acquires
  /// is collected after the grace period like any detached one.
  pub fn get_or_create(
    &self,
    shape: &ShapeDefinition,
    params: &Params,
    mutation: Option<&MutationDefinition>,
  ) -> SyncResult<Arc<Collection>> {
    let mut entries = self.entries();
    self.get_or_create_locked(&mut entries, shape, params, mutation)
  }

  fn get_or_create_locked(
    &self,
    entries: &mut HashMap<CollectionId, Entry>,
    shape: &ShapeDefinition,
    params: &Params,
    mutation: Option<&MutationDefinition>,
  ) -> SyncResult<Arc<Collection>> {
    let id = CollectionId::new(shape.table(), params, mutation.is_some());
    if let Some(entry) = entries.get(&id) {
      return Ok(Arc::clone(&entry.collection));
    }

    let url = resolve_url(&self.base_url, &shape.render_url(params)?)?;
    let mutations = mutation
      .map(|definition| {
        MutationHandlers::new(self.http.clone(), self.tokens.clone(), &self.base_url, definition)
      })
      .transpose()?;

    debug!("Creating collection {}", id);
    let collection = Collection::new(
      id.clone(),
      shape.clone(),
      url,
      self.http.clone(),
      self.tokens.clone(),
      mutations,
      self.config.clone(),
    );
    entries.insert(
      id,
      Entry {
        collection: Arc::clone(&collection),
        subscribers: 0,
        detached_at: Some(Instant::now()),
      },
    );

    Ok(collection)
  }

  /// Like `get_or_create`, but keeps the collection alive until the
  /// returned lease is dropped.
  ///
  /// Lookup and subscribe happen under one lock, so a concurrent `sweep`
  /// can never dispose the collection in between.
  pub fn acquire(
    self: &Arc<Self>,
    shape: &ShapeDefinition,
    params: &Params,
    mutation: Option<&MutationDefinition>,
  ) -> SyncResult<CollectionLease> {
    let mut entries = self.entries();
    let collection = self.get_or_create_locked(&mut entries, shape, params, mutation)?;
    let id = collection.id().clone();
    if let Some(entry) = entries.get_mut(&id) {
      entry.subscribers += 1;
      entry.detached_at = None;
    }
    drop(entries);

    Ok(CollectionLease {
      registry: Arc::clone(self),
      id,
      collection,
    })
  }

  fn release(&self, id: &CollectionId, collection: &Arc<Collection>) {
    let mut entries = self.entries();
    let Some(entry) = entries.get_mut(id) else {
      return;
    };
    // The entry may have been swept and recreated since the lease was taken
    if !Arc::ptr_eq(&entry.collection, collection) {
      return;
    }

    entry.subscribers = entry.subscribers.saturating_sub(1);
    if entry.subscribers == 0 {
      entry.detached_at = Some(Instant::now());
    }
  }

  /// Dispose collections that have had no subscribers for the grace period.
  /// Returns how many were removed.
  pub fn sweep(&self) -> usize {
    let now = Instant::now();
    let expired: Vec<Arc<Collection>> = {
      let mut entries = self.entries();
      let ids: Vec<CollectionId> = entries
        .iter()
        .filter(|(_, entry)| {
          entry.subscribers == 0
            && entry
              .detached_at
              .is_some_and(|at| now.saturating_duration_since(at) >= self.gc_grace)
        })
        .map(|(id, _)| id.clone())
        .collect();

      ids
        .iter()
        .filter_map(|id| entries.remove(id))
        .map(|entry| entry.collection)
        .collect()
    };

    for collection in &expired {
      collection.dispose();
    }
    if !expired.is_empty() {
      debug!("Swept {} idle collections", expired.len());
    }
    expired.len()
  }

  /// Run `sweep` every `interval` for as long as the registry is alive.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let registry: Weak<Self> = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
          break;
        };
        registry.sweep();
      }
    })
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries().is_empty()
  }

  pub fn contains(&self, id: &CollectionId) -> bool {
    self.entries().contains_key(id)
  }

  /// Dispose every collection regardless of subscribers.
  pub fn dispose_all(&self) {
    let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
    if !drained.is_empty() {
      info!("Disposing {} collections", drained.len());
    }
    for entry in drained {
      entry.collection.dispose();
    }
  }
}

/// A subscriber's hold on a collection.
pub struct CollectionLease {
  registry: Arc<CollectionRegistry>,
  id: CollectionId,
  collection: Arc<Collection>,
}

impl CollectionLease {
  pub fn collection(&self) -> &Arc<Collection> {
    &self.collection
  }

  pub fn id(&self) -> &CollectionId {
    &self.id
  }
}

impl Drop for CollectionLease {
  fn drop(&mut self) {
    self.registry.release(&self.id, &self.collection);
  }
}
