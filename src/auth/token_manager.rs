//! Shared access-token cache with single-flight refresh.
//!
//! One `TokenManager` is shared by every collection and mutation handler of a
//! client. It hands out a cached token while it is fresh and makes sure that
//! concurrent refresh requests (typically a burst of 401s from many shape
//! streams) share a single call to the token endpoint. While a refresh is in
//! flight all registered subscriptions are paused so they stop issuing
//! requests with a token that is known to be stale.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::source::TokenSource;

/// A subscription that can stop and restart its network activity.
pub trait Pausable: Send + Sync {
  fn pause(&self);
  fn resume(&self);
}

/// Sent whenever a refresh starts or finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshEvent {
  pub refreshing: bool,
}

type TokenFuture = Shared<BoxFuture<'static, Option<String>>>;

struct CachedToken {
  value: String,
  fetched_at: Instant,
}

#[derive(Default)]
struct State {
  token: Option<CachedToken>,
  /// In-flight refresh. Doubles as the "refreshing" flag.
  refresh: Option<TokenFuture>,
  /// In-flight fetch for an expired (not rejected) token
  fetch: Option<TokenFuture>,
  /// Bumped on every refresh so a slower plain fetch can't overwrite it
  generation: u64,
  shapes: Vec<(u64, Weak<dyn Pausable>)>,
  next_shape_id: u64,
}

impl State {
  fn live_shapes(&mut self) -> Vec<Arc<dyn Pausable>> {
    self.shapes.retain(|(_, shape)| shape.strong_count() > 0);
    self
      .shapes
      .iter()
      .filter_map(|(_, shape)| shape.upgrade())
      .collect()
  }
}

pub struct TokenManager {
  source: Arc<dyn TokenSource>,
  ttl: Duration,
  state: Mutex<State>,
  events: broadcast::Sender<RefreshEvent>,
}

impl TokenManager {
  pub fn new(source: Arc<dyn TokenSource>, ttl: Duration) -> Arc<Self> {
    let (events, _) = broadcast::channel(16);
    Arc::new(Self {
      source,
      ttl,
      state: Mutex::new(State::default()),
      events,
    })
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Current access token, or `None` when none can be obtained.
  ///
  /// Waits for an in-flight refresh instead of starting another fetch.
  pub async fn get_token(self: &Arc<Self>) -> Option<String> {
    let pending = {
      let mut state = self.lock();
      let pending = if let Some(refresh) = &state.refresh {
        refresh.clone()
      } else if let Some(token) = state
        .token
        .as_ref()
        .filter(|t| t.fetched_at.elapsed() < self.ttl)
      {
        return Some(token.value.clone());
      } else if let Some(fetch) = &state.fetch {
        fetch.clone()
      } else {
        let fetch = self.spawn_fetch(state.generation);
        state.fetch = Some(fetch.clone());
        fetch
      };
      pending
    };

    pending.await
  }

  /// Drop the cached token and fetch a new one.
  ///
  /// The pending refresh is stored before this function first yields, so
  /// every caller arriving while it runs joins the same refresh.
  pub async fn trigger_refresh(self: &Arc<Self>) -> Option<String> {
    let pending = {
      let mut state = self.lock();
      let pending = match &state.refresh {
        Some(refresh) => refresh.clone(),
        None => {
          state.token = None;
          state.generation += 1;
          let refresh = self.spawn_refresh();
          state.refresh = Some(refresh.clone());
          let _ = self.events.send(RefreshEvent { refreshing: true });
          refresh
        }
      };
      pending
    };

    pending.await
  }

  /// Register a subscription to be paused while tokens are refreshed.
  ///
  /// A subscription registered mid-refresh is paused right away. Dropping
  /// the returned registration unregisters it.
  pub fn register_shape(self: &Arc<Self>, shape: Weak<dyn Pausable>) -> ShapeRegistration {
    // Declared before the guard so it is released after the lock
    let mut paused: Option<Arc<dyn Pausable>> = None;
    let id = {
      let mut state = self.lock();
      let id = state.next_shape_id;
      state.next_shape_id += 1;

      if state.refresh.is_some() {
        paused = shape.upgrade();
        if let Some(shape) = &paused {
          debug!("Pausing newly registered shape during token refresh");
          shape.pause();
        }
      }
      state.shapes.push((id, shape));
      id
    };
    drop(paused);

    ShapeRegistration {
      manager: Arc::downgrade(self),
      id,
    }
  }

  /// Receive a `RefreshEvent` on every refresh transition.
  pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
    self.events.subscribe()
  }

  pub fn is_refreshing(&self) -> bool {
    self.lock().refresh.is_some()
  }

  /// Forget the cached token and every registered subscription.
  pub fn shutdown(&self) {
    let mut state = self.lock();
    state.token = None;
    state.shapes.clear();
  }

  fn unregister(&self, id: u64) {
    self.lock().shapes.retain(|(shape_id, _)| *shape_id != id);
  }

  async fn fetch_from_source(&self) -> Option<String> {
    match self.source.fetch_token().await {
      Ok(Some(token)) => Some(token.access_token),
      Ok(None) => {
        warn!("Token endpoint returned no token");
        None
      }
      Err(e) => {
        warn!("Failed to fetch access token: {}", e);
        None
      }
    }
  }

  // Fetches run on their own task so a caller that stops waiting can't leave
  // the in-flight slot occupied forever.

  fn spawn_fetch(self: &Arc<Self>, generation: u64) -> TokenFuture {
    let manager = Arc::clone(self);
    let task = tokio::spawn(async move {
      let token = manager.fetch_from_source().await;

      let mut state = manager.lock();
      state.fetch = None;
      if let Some(value) = &token {
        if state.generation == generation {
          state.token = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
          });
        }
      }
      token
    });

    async move { task.await.ok().flatten() }.boxed().shared()
  }

  fn spawn_refresh(self: &Arc<Self>) -> TokenFuture {
    let manager = Arc::clone(self);
    let task = tokio::spawn(async move {
      // Shapes are moved out of each block so the last strong reference is
      // never dropped while the lock is held.
      let paused = {
        let mut state = manager.lock();
        let shapes = state.live_shapes();
        for shape in &shapes {
          shape.pause();
        }
        shapes
      };
      debug!("Refreshing access token, paused {} shapes", paused.len());
      drop(paused);

      let token = manager.fetch_from_source().await;

      let resumed = {
        let mut state = manager.lock();
        if let Some(value) = &token {
          state.token = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
          });
        }
        state.refresh = None;
        let shapes = state.live_shapes();
        for shape in &shapes {
          shape.resume();
        }
        shapes
      };

      match &token {
        Some(_) => info!("Access token refreshed, resumed {} shapes", resumed.len()),
        None => warn!("Access token refresh failed, resumed {} shapes", resumed.len()),
      }
      let _ = manager.events.send(RefreshEvent { refreshing: false });
      drop(resumed);

      token
    });

    async move { task.await.ok().flatten() }.boxed().shared()
  }
}

/// Keeps a subscription registered with a `TokenManager`.
pub struct ShapeRegistration {
  manager: Weak<TokenManager>,
  id: u64,
}

impl Drop for ShapeRegistration {
  fn drop(&mut self) {
    if let Some(manager) = self.manager.upgrade() {
      manager.unregister(self.id);
    }
  }
}
