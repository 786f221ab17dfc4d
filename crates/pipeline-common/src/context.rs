//! Stream processing context
//!
//! Shared context for the stages of one transmuxer instance. Stages use it
//! to attribute their log lines; independent instances get independent
//! contexts and share nothing.

use std::sync::Arc;

/// Shared context for one pipeline instance.
#[derive(Debug, Clone)]
pub struct StreamerContext {
    /// Name of the stream being processed
    pub name: String,
}

impl StreamerContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn arc_new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }
}

impl Default for StreamerContext {
    fn default() -> Self {
        Self::new("DefaultStreamer")
    }
}
