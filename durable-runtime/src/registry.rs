//! Interpreter registry.
//!
//! Maps a record's `workflow_type` to the interpreter that governs it. Like
//! any registry of code, it cannot be persisted: every process that
//! dispatches deliveries builds the same registry at startup.
//!
//! ```rust,ignore
//! fn build_registry() -> InterpreterRegistry {
//!     InterpreterRegistry::new()
//!         .register("order", OrderInterpreter::default())
//!         .register("approval", ApprovalInterpreter)
//! }
//! ```

use durable_core::Interpreter;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of interpreters keyed by workflow type.
#[derive(Clone, Default)]
pub struct InterpreterRegistry {
    interpreters: HashMap<String, Arc<dyn Interpreter>>,
}

impl InterpreterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interpreter under `workflow_type`, replacing any previous one.
    #[must_use]
    pub fn register(
        mut self,
        workflow_type: impl Into<String>,
        interpreter: impl Interpreter + 'static,
    ) -> Self {
        self.interpreters
            .insert(workflow_type.into(), Arc::new(interpreter));
        self
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn Interpreter>> {
        self.interpreters.get(workflow_type).cloned()
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.interpreters.contains_key(workflow_type)
    }

    /// Registered workflow types, sorted.
    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.interpreters.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.interpreters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interpreters.is_empty()
    }
}
