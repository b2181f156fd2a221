use super::Adapter;
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// In-memory adapter for exercising drivers without hardware.
///
/// Clones share state, so a test can keep one handle while a driver owns another.
#[derive(Clone, Default)]
pub struct MockAdapter {
    written: Arc<Mutex<Vec<String>>>,
    incoming: Arc<Mutex<VecDeque<String>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MockAdapter {
    /// Create an adapter with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a line to be returned by the next `read_lines`.
    pub fn push_line(&self, line: impl Into<String>) {
        self.incoming.lock().push_back(line.into());
    }

    /// Every line written so far.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    /// Make subsequent writes fail as a disconnected port would.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn write_line(&mut self, line: &str) -> AppResult<()> {
        if *self.fail_writes.lock() {
            return Err(LabError::SerialPortNotConnected);
        }
        self.written.lock().push(line.to_string());
        Ok(())
    }

    async fn read_lines(&mut self) -> AppResult<Vec<String>> {
        Ok(self.incoming.lock().drain(..).collect())
    }
}
