//! Measurement routines and the machinery to run them off the UI thread.
//!
//! A [`Routine`] is a long-running async job (a grid search, a time series)
//! executed by a [`handler::RoutineHandler`] on a tokio worker task. Routines
//! never touch UI state directly: they post jobs through the
//! [`ui::UiDispatcher`] in their [`RoutineContext`], and poll the context's
//! [`CancelToken`] at safe points.

pub mod grid_search;
pub mod handler;
pub mod measurement;
pub mod time_series;
pub mod ui;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::AppResult;
use ui::{UiDispatcher, UiSurface};

/// Cooperative cancellation flag shared between a routine and its handler.
///
/// Clones observe the same flag. Once cancelled, a token stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation is requested (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Everything a running routine may use to talk to the outside world.
#[derive(Clone)]
pub struct RoutineContext {
    cancel: CancelToken,
    ui: UiDispatcher,
}

impl RoutineContext {
    /// Context with the given cancel token and UI dispatcher.
    pub fn new(cancel: CancelToken, ui: UiDispatcher) -> Self {
        Self { cancel, ui }
    }

    /// Whether the routine should stop at the next safe point.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the routine is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The token itself.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Dispatcher for UI jobs.
    pub fn ui(&self) -> &UiDispatcher {
        &self.ui
    }

    /// Run `f` on the UI thread.
    ///
    /// With `block`, waits until the UI thread has run it, unless the routine
    /// is cancelled first. A cancelled wait returns `Ok(())`; the job may still
    /// run later.
    pub async fn run_on_ui_thread<F>(&self, f: F, block: bool) -> AppResult<()>
    where
        F: FnOnce(&mut dyn UiSurface) + Send + 'static,
    {
        if !block {
            return self.ui.post(Box::new(f));
        }
        tokio::select! {
            result = self.ui.run_blocking(f) => result,
            _ = self.cancel.cancelled() => Ok(()),
        }
    }
}

/// A job that can be started and cancelled from the UI.
#[async_trait]
pub trait Routine: Send + Sync {
    /// Name used in logs and on buttons.
    fn name(&self) -> &str;

    /// Execute to completion or until `ctx` is cancelled.
    ///
    /// Cancellation is not an error: return `Ok(())` with whatever partial
    /// results were produced.
    async fn run(&self, ctx: RoutineContext) -> AppResult<()>;
}
