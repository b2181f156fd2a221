//! Building blocks shared by measurement routines: setting outputs with the
//! right amount of UI feedback, and averaging a buffered input.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::RoutineContext;
use crate::error::AppResult;
use crate::input::Input;
use crate::output::Output;

/// How much of the UI follows a programmatic output change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueUpdate {
    /// Write to the device only.
    NoGraphics,
    /// Write and update the "last set" display.
    OnlyDisplay,
    /// Write, update the display and move the control knob.
    #[default]
    MoveKnobs,
}

impl ValueUpdate {
    /// `MoveKnobs` when `update_graphics` is set, otherwise `NoGraphics`.
    pub fn from_update_graphics(update_graphics: bool) -> Self {
        if update_graphics {
            ValueUpdate::MoveKnobs
        } else {
            ValueUpdate::NoGraphics
        }
    }
}

/// Write `value` to `output` and report it to the UI as requested.
///
/// The hardware write has completed when this returns. With `block`, the UI
/// update has also run (unless the routine was cancelled meanwhile). A UI
/// that has gone away is logged, not an error. Returns the target actually
/// applied.
pub async fn set_output(
    ctx: &RoutineContext,
    output: &Output,
    value: f64,
    update: ValueUpdate,
    block: bool,
) -> AppResult<f64> {
    let applied = output.set_target(value).await?;
    if update != ValueUpdate::NoGraphics {
        let label = output.label().to_string();
        let move_knob = update == ValueUpdate::MoveKnobs;
        if let Err(e) = ctx
            .run_on_ui_thread(
                move |surface| surface.output_changed(&label, applied, move_knob),
                block,
            )
            .await
        {
            warn!(output = %output.label(), error = %e, "could not show output change");
        }
    }
    Ok(applied)
}

/// Average of at least `sample_count` fresh samples from `input`.
///
/// The buffer is restarted first, then drained every `check_interval` until
/// enough samples arrived. Returns `None` if the routine is cancelled while
/// waiting. A non-buffered input cannot be measured; that is logged and
/// reported as `0.0`.
pub async fn measure(
    ctx: &RoutineContext,
    input: &dyn Input,
    sample_count: usize,
    check_interval: Duration,
) -> AppResult<Option<f64>> {
    let Some(buffered) = input.as_buffered() else {
        error!(input = %input.label(), "cannot measure an input without a buffer");
        return Ok(Some(0.0));
    };
    let wanted = sample_count.max(1);

    buffered.restart_buffer().await;
    let mut samples = Vec::with_capacity(wanted);
    let mut polls = 0u32;
    while samples.len() < wanted {
        tokio::select! {
            _ = tokio::time::sleep(check_interval) => {}
            _ = ctx.cancelled() => return Ok(None),
        }
        polls += 1;
        samples.extend(buffered.clear_buffer(false).await);
    }

    let average = samples.iter().sum::<f64>() / samples.len() as f64;
    debug!(input = %input.label(), samples = samples.len(), polls, average, "measured");
    Ok(Some(average))
}
