//! Line-oriented transport adapters.
//!
//! Every instrument in the lab speaks a line-based ASCII protocol over a USB
//! serial bridge. Drivers talk to an [`Adapter`] and never to the port itself,
//! so they can be exercised against [`MockAdapter`] in tests.

pub mod mock;
pub mod ports;
pub mod serial_adapter;

pub use mock::MockAdapter;
pub use serial_adapter::SerialAdapter;

use crate::error::AppResult;
use async_trait::async_trait;

/// Transport for line-terminated ASCII protocols.
#[async_trait]
pub trait Adapter: Send {
    /// Write one command. The adapter appends its configured line terminator.
    async fn write_line(&mut self, line: &str) -> AppResult<()>;

    /// Every complete line received since the previous call, without terminators.
    ///
    /// Never waits for data: returns an empty vector when nothing complete
    /// has arrived. Partial lines are kept for the next call.
    async fn read_lines(&mut self) -> AppResult<Vec<String>>;
}

/// Split `pending` into complete lines, leaving any trailing partial line in place.
pub(crate) fn take_complete_lines(pending: &mut String) -> Vec<String> {
    let Some(last_newline) = pending.rfind('\n') else {
        return Vec::new();
    };
    let rest = pending.split_off(last_newline + 1);
    let complete = std::mem::replace(pending, rest);
    complete
        .split('\n')
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
