//! Optimization lifecycle events.
//!
//! Events form a tagged sum type: progress updates, a terminal `complete`
//! with the completion payload, or a terminal `error`. Terminal events make
//! the broker close the id's streams after a short grace window.

mod broker;

pub use broker::{
    SseBroker, SubscribeError, DEFAULT_CHANNEL_IDLE_SECS, DEFAULT_TERMINAL_GRACE_SECS,
};

use serde::{Deserialize, Serialize};

/// A lifecycle event for one optimization id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimizationEvent {
    /// Work is progressing; non-terminal.
    #[serde(rename_all = "camelCase")]
    Progress {
        optimization_id: String,
        /// 0-100
        percent: u8,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_index: Option<usize>,
    },

    /// Terminal success; `payload` mirrors the callback payload.
    #[serde(rename_all = "camelCase")]
    Complete {
        optimization_id: String,
        payload: serde_json::Value,
    },

    /// Terminal failure.
    #[serde(rename_all = "camelCase")]
    Error {
        optimization_id: String,
        message: String,
    },
}

impl OptimizationEvent {
    /// A progress event without file-scoped fields.
    pub fn progress(id: impl Into<String>, percent: u8, message: impl Into<String>) -> Self {
        Self::Progress {
            optimization_id: id.into(),
            percent: percent.min(100),
            message: message.into(),
            current_file: None,
            file_index: None,
        }
    }

    /// The optimization id this event belongs to.
    pub fn optimization_id(&self) -> &str {
        match self {
            Self::Progress {
                optimization_id, ..
            }
            | Self::Complete {
                optimization_id, ..
            }
            | Self::Error {
                optimization_id, ..
            } => optimization_id,
        }
    }

    /// Whether this event ends the stream for its id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}
