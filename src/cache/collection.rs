//! A live, locally cached mirror of one shape.
//!
//! Each collection runs a change-stream loop on its own task: it long-polls
//! the shape endpoint, applies changes to the synced row set and records the
//! transaction ids it has seen so optimistic writes can be confirmed. The
//! loop stops issuing requests while the collection is paused (during a
//! token refresh) and reconnects with backoff after failures.

use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::error_handler::ErrorHandler;
use super::registry::CollectionId;
use super::state::{CollectionState, PendingChange};
use crate::auth::{Pausable, ShapeRegistration, TokenManager};
use crate::config::Config;
use crate::error::{error_from_response, SyncError, SyncResult};
use crate::mutation::{MutationHandlers, MutationRequest, Persisted};
use crate::shape::stream::{
  parse_values, Control, Message, Schema, StreamPosition, HANDLE_HEADER, OFFSET_HEADER,
  SCHEMA_HEADER,
};
use crate::shape::{row_key, Row, ShapeDefinition, Txid};

/// Timing knobs for a collection.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
  pub reconnect_initial: Duration,
  pub reconnect_max: Duration,
  pub error_backoff_base: Duration,
  pub error_backoff_max: Duration,
}

impl Default for CollectionConfig {
  fn default() -> Self {
    Self {
      reconnect_initial: Duration::from_secs(1),
      reconnect_max: Duration::from_secs(30),
      error_backoff_base: Duration::from_secs(1),
      error_backoff_max: Duration::from_secs(30),
    }
  }
}

impl From<&Config> for CollectionConfig {
  fn from(config: &Config) -> Self {
    Self {
      reconnect_initial: Duration::from_millis(config.stream.reconnect_initial_ms),
      reconnect_max: Duration::from_millis(config.stream.reconnect_max_ms),
      error_backoff_base: Duration::from_millis(config.errors.base_backoff_ms),
      error_backoff_max: Duration::from_millis(config.errors.max_backoff_ms),
    }
  }
}

/// Lifecycle of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
  /// Not started yet
  Idle,
  /// Syncing, initial snapshot not complete
  Loading,
  /// Caught up with the server
  Ready,
  /// Requests suspended while the access token is refreshed
  Paused,
  Disposed,
}

/// One response worth of stream messages.
struct Batch {
  messages: Vec<Message>,
  handle: Option<String>,
  offset: Option<String>,
  schema: Option<Schema>,
  must_refetch: bool,
}

enum FetchError {
  Unauthorized(SyncError),
  Failed(SyncError),
}

pub struct Collection {
  id: CollectionId,
  shape: ShapeDefinition,
  url: Url,
  http: reqwest::Client,
  tokens: Arc<TokenManager>,
  mutations: Option<MutationHandlers>,
  config: CollectionConfig,
  state: RwLock<CollectionState>,
  errors: Mutex<ErrorHandler>,
  error: Mutex<Option<SyncError>>,
  /// Bumped on every visible change
  version: watch::Sender<u64>,
  paused: watch::Sender<bool>,
  disposed: AtomicBool,
  task: Mutex<Option<JoinHandle<()>>>,
  registration: Mutex<Option<ShapeRegistration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Collection {
  pub fn new(
    id: CollectionId,
    shape: ShapeDefinition,
    url: Url,
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    mutations: Option<MutationHandlers>,
    config: CollectionConfig,
  ) -> Arc<Self> {
    let errors = ErrorHandler::new(config.error_backoff_base, config.error_backoff_max);
    Arc::new(Self {
      id,
      shape,
      url,
      http,
      tokens,
      mutations,
      config,
      state: RwLock::new(CollectionState::default()),
      errors: Mutex::new(errors),
      error: Mutex::new(None),
      version: watch::channel(0).0,
      paused: watch::channel(false).0,
      disposed: AtomicBool::new(false),
      task: Mutex::new(None),
      registration: Mutex::new(None),
    })
  }

  pub fn id(&self) -> &CollectionId {
    &self.id
  }

  pub fn shape(&self) -> &ShapeDefinition {
    &self.shape
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn mutation_handlers(&self) -> Option<&MutationHandlers> {
    self.mutations.as_ref()
  }

  pub fn has_mutations(&self) -> bool {
    self.mutations.is_some()
  }

  fn read_state(&self) -> RwLockReadGuard<'_, CollectionState> {
    self.state.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write_state(&self) -> RwLockWriteGuard<'_, CollectionState> {
    self.state.write().unwrap_or_else(|e| e.into_inner())
  }

  fn notify(&self) {
    self.version.send_modify(|v| *v = v.wrapping_add(1));
  }

  // ---------------------------------------------------------------------
  // Read model
  // ---------------------------------------------------------------------

  /// Visible rows, optimistic changes included, ordered by key.
  pub fn rows(&self) -> Vec<Row> {
    self.read_state().rows()
  }

  pub fn get(&self, key: &str) -> Option<Row> {
    self.read_state().get(key)
  }

  pub fn is_ready(&self) -> bool {
    self.read_state().is_up_to_date()
  }

  /// The last reported error, cleared by the next successful response.
  pub fn error(&self) -> Option<SyncError> {
    lock(&self.error).clone()
  }

  pub fn clear_error(&self) {
    let had_error = lock(&self.error).take().is_some();
    lock(&self.errors).reset();
    if had_error {
      self.notify();
    }
  }

  pub fn status(&self) -> CollectionStatus {
    if self.is_disposed() {
      return CollectionStatus::Disposed;
    }
    if *self.paused.borrow() {
      return CollectionStatus::Paused;
    }
    if lock(&self.task).is_none() {
      return CollectionStatus::Idle;
    }
    if self.is_ready() {
      CollectionStatus::Ready
    } else {
      CollectionStatus::Loading
    }
  }

  /// A receiver that changes whenever the visible state does.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.version.subscribe()
  }

  /// Wait until the initial snapshot has been received.
  pub async fn ready(&self) -> SyncResult<()> {
    let mut updates = self.version.subscribe();
    loop {
      let ready = self.is_ready();
      if ready {
        return Ok(());
      }
      if self.is_disposed() {
        return Err(SyncError::new(format!("Collection {} was disposed", self.id)));
      }
      if updates.changed().await.is_err() {
        return Err(SyncError::new(format!("Collection {} was dropped", self.id)));
      }
    }
  }

  /// Wait until a staged mutation has been confirmed by the stream.
  async fn await_settled(&self, mutation_id: u64) -> SyncResult<()> {
    let mut updates = self.version.subscribe();
    loop {
      let pending = self.read_state().is_pending(mutation_id);
      if !pending {
        return Ok(());
      }
      if self.is_disposed() {
        return Err(SyncError::new(format!(
          "Collection {} was disposed before the mutation was confirmed",
          self.id
        )));
      }
      if updates.changed().await.is_err() {
        return Err(SyncError::new(format!("Collection {} was dropped", self.id)));
      }
    }
  }

  // ---------------------------------------------------------------------
  // Lifecycle
  // ---------------------------------------------------------------------

  /// Start the stream loop. Idempotent.
  pub fn start(self: &Arc<Self>) {
    if self.is_disposed() {
      return;
    }

    let mut task = lock(&self.task);
    if task.as_ref().is_some_and(|t| !t.is_finished()) {
      return;
    }

    {
      let mut registration = lock(&self.registration);
      if registration.is_none() {
        let weak: Weak<Collection> = Arc::downgrade(self);
        let weak: Weak<dyn Pausable> = weak;
        *registration = Some(self.tokens.register_shape(weak));
      }
    }

    debug!("Starting collection {}", self.id);
    *task = Some(tokio::spawn(Arc::clone(self).sync_loop(StreamPosition::initial())));
  }

  /// Throw away the synced rows and re-read the shape from scratch,
  /// bypassing intermediate caches.
  pub fn restart(self: &Arc<Self>) {
    if self.is_disposed() {
      return;
    }

    if let Some(task) = lock(&self.task).take() {
      task.abort();
    }
    self.write_state().reset();
    lock(&self.error).take();
    lock(&self.errors).reset();

    let position = StreamPosition::initial().with_cache_buster(Uuid::new_v4().simple().to_string());
    info!("Restarting collection {}", self.id);
    *lock(&self.task) = Some(tokio::spawn(Arc::clone(self).sync_loop(position)));
    self.notify();
  }

  /// Stop syncing for good.
  pub fn dispose(&self) {
    if self.disposed.swap(true, Ordering::SeqCst) {
      return;
    }

    if let Some(task) = lock(&self.task).take() {
      task.abort();
    }
    lock(&self.registration).take();
    info!("Disposed collection {}", self.id);
    self.notify();
  }

  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::SeqCst)
  }

  // ---------------------------------------------------------------------
  // Stream loop
  // ---------------------------------------------------------------------

  async fn sync_loop(self: Arc<Self>, mut position: StreamPosition) {
    let mut delay = self.config.reconnect_initial;
    let mut refreshed = false;

    loop {
      self.until_resumed().await;

      // Pausing drops the in-flight request; that's not an error.
      let result = tokio::select! {
        result = self.request(&position) => result,
        _ = self.until_paused() => {
          debug!("Collection {} paused mid-request", self.id);
          continue;
        }
      };

      match result {
        Ok(batch) => {
          self.apply_batch(batch, &mut position);
          self.on_success();
          delay = self.config.reconnect_initial;
          refreshed = false;
          continue;
        }
        Err(FetchError::Unauthorized(err)) => {
          // One refresh per failure streak; a server that keeps rejecting
          // fresh tokens is reported like any other error.
          if !refreshed {
            refreshed = true;
            debug!("Collection {} got 401, refreshing access token", self.id);
            if self.tokens.trigger_refresh().await.is_some() {
              continue;
            }
          }
          self.report(err);
        }
        Err(FetchError::Failed(err)) => self.report(err),
      }

      tokio::time::sleep(delay).await;
      delay = (delay * 2).min(self.config.reconnect_max);
    }
  }

  async fn until_resumed(&self) {
    let mut paused = self.paused.subscribe();
    let _ = paused.wait_for(|p| !*p).await;
  }

  async fn until_paused(&self) {
    let mut paused = self.paused.subscribe();
    let _ = paused.wait_for(|p| *p).await;
  }

  async fn request(&self, position: &StreamPosition) -> Result<Batch, FetchError> {
    let mut request = self.http.get(self.url.clone()).query(&position.query());
    // Resolved per request so a refreshed token is picked up immediately
    if let Some(token) = self.tokens.get_token().await {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| FetchError::Failed(SyncError::from(e)))?;

    let status = response.status();
    if status == StatusCode::CONFLICT {
      return Ok(Batch::must_refetch());
    }
    if !status.is_success() {
      let fallback = status.canonical_reason().unwrap_or("Shape request failed");
      let err = error_from_response(response, fallback).await;
      return Err(if err.is_unauthorized() {
        FetchError::Unauthorized(err)
      } else {
        FetchError::Failed(err)
      });
    }

    let (handle, offset, schema) = {
      let header = |name: &str| {
        response
          .headers()
          .get(name)
          .and_then(|v| v.to_str().ok())
          .map(String::from)
      };
      let schema = header(SCHEMA_HEADER).and_then(|raw| serde_json::from_str::<Schema>(&raw).ok());
      (header(HANDLE_HEADER), header(OFFSET_HEADER), schema)
    };

    let messages = if status == StatusCode::NO_CONTENT {
      Vec::new()
    } else {
      response
        .json::<Vec<Message>>()
        .await
        .map_err(|e| FetchError::Failed(SyncError::new(format!("Invalid shape response: {}", e))))?
    };

    Ok(Batch {
      messages,
      handle,
      offset,
      schema,
      must_refetch: false,
    })
  }

  fn apply_batch(&self, batch: Batch, position: &mut StreamPosition) {
    position.cache_buster = None;
    if let Some(handle) = batch.handle {
      position.handle = Some(handle);
    }
    if let Some(offset) = batch.offset {
      position.offset = offset;
    }
    if let Some(schema) = batch.schema {
      position.schema = schema;
    }

    let mut changed = false;
    {
      let mut state = self.write_state();

      if batch.must_refetch {
        debug!("Collection {} must refetch", self.id);
        *position = StreamPosition::initial();
        state.reset();
        changed = true;
      }

      for message in batch.messages {
        match message.headers.control {
          Some(Control::UpToDate) => {
            position.live = true;
            changed |= state.mark_up_to_date();
          }
          Some(Control::MustRefetch) => {
            debug!("Collection {} must refetch", self.id);
            *position = StreamPosition::initial();
            state.reset();
            changed = true;
          }
          Some(Control::Unknown) => {}
          None => {
            let Some(operation) = message.headers.operation else {
              continue;
            };
            let mut value = message.value.unwrap_or_default();
            parse_values(&mut value, &position.schema, &self.shape);
            state.observe_txids(&message.headers.txids);
            changed |= state.apply_change(operation, value);
          }
        }
      }

      changed |= state.settle();
    }

    if changed {
      self.notify();
    }
  }

  fn on_success(&self) {
    lock(&self.errors).reset();
    let had_error = lock(&self.error).take().is_some();
    if had_error {
      self.notify();
    }
  }

  fn report(&self, err: SyncError) {
    let report = lock(&self.errors).should_report(&err.message);
    if !report {
      return;
    }

    warn!("Collection {} failed to sync: {}", self.id, err);
    *lock(&self.error) = Some(err);
    self.notify();
  }

  // ---------------------------------------------------------------------
  // Optimistic writes
  // ---------------------------------------------------------------------

  /// Apply inserts locally and send them. One `Persisted` per row, in order,
  /// resolving to the server's version of the row (or the optimistic one if
  /// the server's is gone by then).
  pub fn insert(self: &Arc<Self>, rows: Vec<Row>) -> Vec<Persisted<Row>> {
    let Some(handlers) = self.writable() else {
      return rows.iter().map(|_| Persisted::ready(Err(self.read_only_error()))).collect();
    };

    let mut persisted = Vec::with_capacity(rows.len());
    let mut staged = Vec::new();
    let mut requests = Vec::new();
    {
      let mut state = self.write_state();
      for row in rows {
        let Some(key) = row_key(&row) else {
          persisted.push(Persisted::ready(Err(SyncError::new(
            "Cannot insert a row without an id",
          ))));
          continue;
        };

        let (tx, rx) = Persisted::channel();
        let mutation_id = state.stage(key.clone(), PendingChange::Insert(row.clone()));
        staged.push(Staged {
          mutation_id,
          key,
          reply: Reply::Row {
            optimistic: row.clone(),
            tx,
          },
        });
        requests.push(MutationRequest::Insert(row));
        persisted.push(rx);
      }
    }

    self.notify();
    self.commit(handlers, staged, requests);
    persisted
  }

  /// Apply a partial update locally and send it.
  pub fn update(self: &Arc<Self>, key: &str, changes: Row) -> Persisted<()> {
    let request = MutationRequest::Update {
      key: key.to_string(),
      changes: changes.clone(),
    };
    self.stage_one(key, PendingChange::Update(changes), request)
  }

  /// Remove a row locally and send the delete.
  pub fn delete(self: &Arc<Self>, key: &str) -> Persisted<()> {
    let request = MutationRequest::Delete {
      key: key.to_string(),
    };
    self.stage_one(key, PendingChange::Delete, request)
  }

  fn stage_one(
    self: &Arc<Self>,
    key: &str,
    change: PendingChange,
    request: MutationRequest,
  ) -> Persisted<()> {
    let Some(handlers) = self.writable() else {
      return Persisted::ready(Err(self.read_only_error()));
    };

    let (tx, rx) = Persisted::channel();
    let mutation_id = self.write_state().stage(key.to_string(), change);
    self.notify();

    let staged = Staged {
      mutation_id,
      key: key.to_string(),
      reply: Reply::Unit(tx),
    };
    self.commit(handlers, vec![staged], vec![request]);
    rx
  }

  fn writable(&self) -> Option<MutationHandlers> {
    if self.is_disposed() {
      return None;
    }
    self.mutations.clone()
  }

  fn read_only_error(&self) -> SyncError {
    if self.is_disposed() {
      SyncError::new(format!("Collection {} was disposed", self.id))
    } else {
      SyncError::new(format!("Collection {} is read-only", self.id))
    }
  }

  /// Send staged writes and settle each one independently.
  fn commit(
    self: &Arc<Self>,
    handlers: MutationHandlers,
    staged: Vec<Staged>,
    requests: Vec<MutationRequest>,
  ) {
    if staged.is_empty() {
      return;
    }

    let collection = Arc::clone(self);
    tokio::spawn(async move {
      let results = handlers.dispatch(&requests).await;

      let confirmations = staged.into_iter().zip(results).map(|(staged, result)| {
        let collection = Arc::clone(&collection);
        async move {
          let outcome = collection.confirm(staged.mutation_id, result).await;
          match staged.reply {
            Reply::Row { optimistic, tx } => {
              let row = outcome.map(|()| {
                let synced = collection.read_state().synced_row(&staged.key);
                synced.unwrap_or(optimistic)
              });
              let _ = tx.send(row);
            }
            Reply::Unit(tx) => {
              let _ = tx.send(outcome);
            }
          }
        }
      });

      futures::future::join_all(confirmations).await;
    });
  }

  async fn confirm(&self, mutation_id: u64, result: SyncResult<Vec<Txid>>) -> SyncResult<()> {
    match result {
      Ok(txids) => {
        debug!("Collection {} waiting for txids {:?}", self.id, txids);
        self.write_state().attach_txids(mutation_id, txids);
        self.notify();
        self.await_settled(mutation_id).await
      }
      Err(err) => {
        // Rejected: the optimistic change must not linger until the next sync
        self.write_state().rollback(mutation_id);
        self.notify();
        Err(err)
      }
    }
  }
}

impl Pausable for Collection {
  fn pause(&self) {
    if !self.paused.send_replace(true) {
      debug!("Paused collection {}", self.id);
    }
  }

  fn resume(&self) {
    if self.paused.send_replace(false) {
      debug!("Resumed collection {}", self.id);
    }
  }
}

impl Batch {
  fn must_refetch() -> Self {
    Self {
      messages: Vec::new(),
      handle: None,
      offset: None,
      schema: None,
      must_refetch: true,
    }
  }
}

struct Staged {
  mutation_id: u64,
  key: String,
  reply: Reply,
}

enum Reply {
  Row {
    optimistic: Row,
    tx: oneshot::Sender<SyncResult<Row>>,
  },
  Unit(oneshot::Sender<SyncResult<()>>),
}
