//! Action handlers and failure reporting.

use crate::error::{SyncError, SyncResult};
use appstate_crypto::TrustedMutation;
use appstate_protocol::PatchType;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Applies the effect of a verified mutation (archive a chat, pin it, ...).
pub trait ActionHandler: Send + Sync {
    /// Applies one mutation.
    fn apply(&self, patch_type: PatchType, mutation: &TrustedMutation) -> SyncResult<()>;
}

/// Finds the handler for an action name.
pub trait HandlerRegistry: Send + Sync {
    /// Returns the handler for `action_name`, if one is registered.
    fn find_handler(&self, action_name: &str) -> Option<Arc<dyn ActionHandler>>;
}

/// Receives failures the application must hear about.
pub trait ErrorSink: Send + Sync {
    /// Reports a failure at `location`.
    fn report_failure(&self, location: &str, error: &SyncError);
}

/// Reports failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report_failure(&self, location: &str, error: &SyncError) {
        tracing::error!(location, %error, "app state sync failure");
    }
}

/// A name-keyed handler registry.
#[derive(Default)]
pub struct HandlerMap {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl HandlerMap {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `action_name`, replacing any previous one.
    pub fn register(&self, action_name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().insert(action_name.into(), handler);
    }
}

impl HandlerRegistry for HandlerMap {
    fn find_handler(&self, action_name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.read().get(action_name).cloned()
    }
}

/// A handler that records what it was given, for testing.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    applied: Mutex<Vec<(PatchType, TrustedMutation)>>,
}

impl RecordingHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mutation applied so far, in order.
    pub fn applied(&self) -> Vec<(PatchType, TrustedMutation)> {
        self.applied.lock().clone()
    }

    /// Number of mutations applied so far.
    pub fn count(&self) -> usize {
        self.applied.lock().len()
    }
}

impl ActionHandler for RecordingHandler {
    fn apply(&self, patch_type: PatchType, mutation: &TrustedMutation) -> SyncResult<()> {
        self.applied.lock().push((patch_type, mutation.clone()));
        Ok(())
    }
}

/// An error sink that keeps reports, for testing.
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<(String, SyncError)>>,
}

impl RecordingErrorSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every report so far.
    pub fn reports(&self) -> Vec<(String, SyncError)> {
        self.reports.lock().clone()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report_failure(&self, location: &str, error: &SyncError) {
        self.reports.lock().push((location.to_string(), error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let registry = HandlerMap::new();
        let handler = Arc::new(RecordingHandler::new());
        registry.register("archive", handler);

        assert!(registry.find_handler("archive").is_some());
        assert!(registry.find_handler("pin_v1").is_none());
    }

    #[test]
    fn recording_sink_keeps_reports() {
        let sink = RecordingErrorSink::new();
        sink.report_failure("regular", &SyncError::Timeout);
        assert_eq!(sink.reports(), vec![("regular".to_string(), SyncError::Timeout)]);
        TracingErrorSink.report_failure("regular", &SyncError::Timeout);
    }
}
