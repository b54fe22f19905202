//! Resource-owner scopes.
//!
//! A scope is an opaque identity for a bounded region of execution; exit runs
//! the registered release callbacks in phase order so owners can drop GPU
//! resources at exactly the right point relative to lock release.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque scope identity handed out by the host runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleasePhase {
    BeforeLocks,
    Locks,
    AfterLocks,
}

const PHASE_ORDER: [ReleasePhase; 3] = [
    ReleasePhase::BeforeLocks,
    ReleasePhase::Locks,
    ReleasePhase::AfterLocks,
];

/// Cleanup hook invoked once per phase while a scope exits.
pub trait ScopeExitCallback: Send + Sync {
    fn on_exit(&self, scope: ScopeId, phase: ReleasePhase, committed: bool);
}

/// Tracks the scope stack of a session and the registered exit callbacks.
pub struct ScopeManager {
    callbacks: Mutex<Vec<Arc<dyn ScopeExitCallback>>>,
    stack: Mutex<Vec<ScopeId>>,
    next_id: AtomicU64,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            stack: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register_release_callback(&self, callback: Arc<dyn ScopeExitCallback>) {
        self.callbacks.lock().push(callback);
    }

    /// Open a new scope and make it current.
    pub fn enter_scope(&self) -> ScopeId {
        let scope = ScopeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.stack.lock().push(scope);
        scope
    }

    /// The innermost open scope, if any.
    pub fn current_scope(&self) -> Option<ScopeId> {
        self.stack.lock().last().copied()
    }

    /// Close a scope, running every release callback for each phase in
    /// order. `committed` distinguishes normal commit from error unwind.
    pub fn exit_scope(&self, scope: ScopeId, committed: bool) {
        {
            let mut stack = self.stack.lock();
            if let Some(pos) = stack.iter().rposition(|&s| s == scope) {
                stack.remove(pos);
            }
        }
        tracing::debug!(scope = scope.0, committed, "scope exits");
        let callbacks: Vec<_> = self.callbacks.lock().clone();
        for phase in PHASE_ORDER {
            for callback in &callbacks {
                callback.on_exit(scope, phase, committed);
            }
        }
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}
