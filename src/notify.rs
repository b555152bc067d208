//! Completion events from background commit and merge jobs

use std::fmt;
use std::sync::Arc;

/// Identifies the layer a background job reported about.
///
/// Tokens are derived from the `Arc` identity of the layer's index, so
/// they stay valid across re-sorting and renumbering of the layer list.
pub type LayerToken = usize;

/// Outcome of a background commit or merge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Nothing happened yet
    None,
    /// The job produced a serialized result
    Ok,
    /// The job finished but produced no surviving data
    Empty,
    /// The job was canceled before completion
    Canceled,
    /// The job failed
    Failed,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Event::None => "none",
            Event::Ok => "ok",
            Event::Empty => "empty",
            Event::Canceled => "canceled",
            Event::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Callback invoked by background jobs when they finish
pub type NotifyFn = Arc<dyn Fn(LayerToken, Event) + Send + Sync>;

/// A notify callback that drops every event
pub fn ignore_notify() -> NotifyFn {
    Arc::new(|_, _| {})
}
