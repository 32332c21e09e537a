//! Lifetime scope for everything a session view starts.
//!
//! Every loop and one-shot request holds a token derived from the scope's
//! root token. Cancelling the scope (explicitly or by dropping it) stops all
//! of them; none of them owns the scope.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct SessionScope {
    root: CancellationToken,
}

impl SessionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn cancel(&self) {
        self.root.cancel();
    }

    /// Spawns `fut` so that it is dropped as soon as the scope is cancelled.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.child();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        })
    }

    /// Awaits `fut` unless the scope is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(StoreError::Destroyed);
        }
        tokio::select! {
            biased;
            _ = self.root.cancelled() => Err(StoreError::Destroyed),
            value = fut => Ok(value),
        }
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// At most one live subscription per key.
///
/// A subscription is live until its token is cancelled, either by the scope,
/// by a replacing subscription, or by the loop itself when it finishes.
#[derive(Debug, Default)]
pub struct KeyedSubscriptions {
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl KeyedSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token for a new subscription, or `None` when one is
    /// already live under `key`.
    pub fn start_if_absent(&self, scope: &SessionScope, key: &str) -> Option<CancellationToken> {
        let mut active = self.active.lock();
        if let Some(existing) = active.get(key) {
            if !existing.is_cancelled() {
                return None;
            }
        }
        let token = scope.child();
        active.insert(key.to_string(), token.clone());
        Some(token)
    }

    /// Cancels any live subscription under `key` and returns the token of its
    /// replacement.
    pub fn replace(&self, scope: &SessionScope, key: &str) -> CancellationToken {
        let token = scope.child();
        if let Some(previous) = self.active.lock().insert(key.to_string(), token.clone()) {
            previous.cancel();
        }
        token
    }

    pub fn is_live(&self, key: &str) -> bool {
        self.active
            .lock()
            .get(key)
            .map(|token| !token.is_cancelled())
            .unwrap_or(false)
    }
}
