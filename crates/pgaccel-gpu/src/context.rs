//! Per-session GPU context registry.
//!
//! A context binds one host scope to one sub-context per usable device. The
//! registry hands the same context back for repeated acquisitions within a
//! scope, refcounts it, and guarantees teardown both on explicit release and
//! through the scope-exit hook. Teardown is best-effort: driver failures are
//! logged and never stop the remaining steps.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use pgaccel_core::arena::Arena;
use pgaccel_core::scope::{ReleasePhase, ScopeExitCallback, ScopeId, ScopeManager};

use crate::device::DeviceInventory;
use crate::driver::{DevContext, DevHandle, DeviceDriver};
use crate::error::GpuError;
use crate::errtext::error_text_with;
use crate::task::GpuTaskState;

const CONTEXT_HASH_SIZE: usize = 100;

/// Host-side handle to a data store attached to a context. The columnar
/// format itself lives elsewhere; the context only guarantees the release
/// hook runs (e.g. unmapping a file-backed store) before its sub-contexts
/// are destroyed.
pub struct DataStore {
    label: String,
    on_release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DataStore {
    pub fn new(label: impl Into<String>, on_release: Box<dyn FnOnce() + Send>) -> Arc<DataStore> {
        Arc::new(DataStore {
            label: label.into(),
            on_release: Mutex::new(Some(on_release)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_released(&self) -> bool {
        self.on_release.lock().is_none()
    }

    pub fn release(&self) {
        if let Some(hook) = self.on_release.lock().take() {
            hook();
        }
    }
}

pub struct GpuContext {
    scope: ScopeId,
    /// Mutated only while the registry lock is held.
    refcnt: AtomicU32,
    sub_contexts: Vec<(DevHandle, DevContext)>,
    cursor: AtomicUsize,
    task_states: Mutex<Vec<Arc<GpuTaskState>>>,
    data_stores: Mutex<Vec<Arc<DataStore>>>,
    arena: Arena,
    destroyed: AtomicBool,
}

impl GpuContext {
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn refcount(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// The context's private arena; lives exactly as long as the context.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn num_sub_contexts(&self) -> usize {
        self.sub_contexts.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Round-robin over the per-device sub-contexts.
    pub(crate) fn next_sub_context(&self) -> (DevHandle, DevContext) {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.sub_contexts.len();
        self.sub_contexts[index]
    }

    pub(crate) fn attach_task_state(&self, state: Arc<GpuTaskState>) {
        self.task_states.lock().push(state);
    }

    pub fn task_states(&self) -> Vec<Arc<GpuTaskState>> {
        self.task_states.lock().clone()
    }

    pub fn attach_data_store(&self, store: Arc<DataStore>) {
        self.data_stores.lock().push(store);
    }
}

struct RegistryState {
    buckets: Vec<Vec<Arc<GpuContext>>>,
    /// One-slot shortcut for the common repeated-acquire case; a hint only,
    /// invalidated whenever its context leaves the registry.
    last: Option<Arc<GpuContext>>,
}

pub struct GpuContextRegistry {
    driver: Arc<dyn DeviceDriver>,
    inventory: Arc<DeviceInventory>,
    state: Mutex<RegistryState>,
}

impl GpuContextRegistry {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        inventory: Arc<DeviceInventory>,
    ) -> Arc<GpuContextRegistry> {
        Arc::new(GpuContextRegistry {
            driver,
            inventory,
            state: Mutex::new(RegistryState {
                buckets: (0..CONTEXT_HASH_SIZE).map(|_| Vec::new()).collect(),
                last: None,
            }),
        })
    }

    /// Register the scope-exit hook with the host's scope manager.
    pub fn register_cleanup(self: &Arc<Self>, scopes: &ScopeManager) {
        scopes.register_release_callback(Arc::new(RegistryCleanup {
            registry: Arc::downgrade(self),
        }));
    }

    /// Return the context bound to `scope`, creating it lazily on the first
    /// acquisition. Each call increments the refcount.
    pub fn acquire(&self, scope: ScopeId) -> Result<Arc<GpuContext>, GpuError> {
        {
            let mut state = self.state.lock();
            if let Some(last) = state.last.clone() {
                if last.scope == scope {
                    last.refcnt.fetch_add(1, Ordering::Relaxed);
                    return Ok(last);
                }
            }
            let bucket = hash_index(scope);
            if let Some(context) = state.buckets[bucket]
                .iter()
                .find(|c| c.scope == scope)
                .cloned()
            {
                context.refcnt.fetch_add(1, Ordering::Relaxed);
                state.last = Some(context.clone());
                return Ok(context);
            }
        }

        // Miss: build the context without holding the registry lock, since
        // creation calls into the driver.
        let context = self.create_context(scope)?;
        let mut state = self.state.lock();
        state.buckets[hash_index(scope)].push(context.clone());
        state.last = Some(context.clone());
        Ok(context)
    }

    /// Drop one reference; the last one unlinks the context and destroys it.
    pub fn release(&self, context: &Arc<GpuContext>) {
        let destroy = {
            let mut state = self.state.lock();
            debug_assert!(context.refcount() > 0);
            if context.refcnt.fetch_sub(1, Ordering::Relaxed) == 1 {
                if state
                    .last
                    .as_ref()
                    .is_some_and(|last| Arc::ptr_eq(last, context))
                {
                    state.last = None;
                }
                let bucket = &mut state.buckets[hash_index(context.scope)];
                bucket.retain(|c| !Arc::ptr_eq(c, context));
                true
            } else {
                false
            }
        };
        if destroy {
            self.release_context(context, true);
        }
    }

    /// Block until all sub-contexts quiesce.
    pub fn sync(&self, context: &GpuContext) {
        for &(_, sub_context) in &context.sub_contexts {
            if let Err(code) = self.driver.ctx_set_current(Some(sub_context)) {
                warn!(
                    "failed on cuCtxSetCurrent: {}",
                    error_text_with(self.driver.as_ref(), code)
                );
            }
            if let Err(code) = self.driver.ctx_synchronize() {
                warn!(
                    "failed on cuCtxSynchronize: {}",
                    error_text_with(self.driver.as_ref(), code)
                );
            }
        }
    }

    /// Whether a context for `scope` is currently registered.
    pub fn contains(&self, scope: ScopeId) -> bool {
        let state = self.state.lock();
        state.buckets[hash_index(scope)]
            .iter()
            .any(|c| c.scope == scope)
    }

    fn create_context(&self, scope: ScopeId) -> Result<Arc<GpuContext>, GpuError> {
        let mut sub_contexts = Vec::with_capacity(self.inventory.devices.len());
        for device in &self.inventory.devices {
            match self.driver.ctx_create(device.handle) {
                Ok(sub_context) => sub_contexts.push((device.handle, sub_context)),
                Err(code) => {
                    for &(_, created) in &sub_contexts {
                        if let Err(code) = self.driver.ctx_destroy(created) {
                            warn!(
                                "failed on cuCtxDestroy: {}",
                                error_text_with(self.driver.as_ref(), code)
                            );
                        }
                    }
                    return Err(GpuError::driver("cuCtxCreate", code));
                }
            }
        }
        debug!(scope = scope.0, devices = sub_contexts.len(), "GPU context created");
        Ok(Arc::new(GpuContext {
            scope,
            refcnt: AtomicU32::new(1),
            sub_contexts,
            cursor: AtomicUsize::new(0),
            task_states: Mutex::new(Vec::new()),
            data_stores: Mutex::new(Vec::new()),
            arena: Arena::new(format!("GPU DMA buffer (scope {})", scope.0)),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Tear a context down. Always completes: every step logs driver
    /// failures at warning and carries on, and the arena is freed last.
    fn release_context(&self, context: &Arc<GpuContext>, is_commit: bool) {
        // Ensure all concurrent tasks have come to rest.
        self.sync(context);

        // Cascade into task-states before the sub-contexts go away.
        let task_states: Vec<Arc<GpuTaskState>> =
            std::mem::take(&mut *context.task_states.lock());
        for state in task_states {
            if is_commit {
                warn!("unreferenced GPU task-state leak (scope {})", context.scope.0);
            }
            state.drain(self.driver.as_ref(), is_commit);
        }

        // Data stores may hold file mappings; drop them now.
        let data_stores: Vec<Arc<DataStore>> = std::mem::take(&mut *context.data_stores.lock());
        for store in data_stores {
            debug!(label = store.label(), "releasing data store");
            store.release();
        }

        for &(_, sub_context) in &context.sub_contexts {
            if let Err(code) = self.driver.ctx_destroy(sub_context) {
                warn!(
                    "failed on cuCtxDestroy: {}",
                    error_text_with(self.driver.as_ref(), code)
                );
            }
        }
        // Leave no context current on this thread.
        let _ = self.driver.ctx_set_current(None);

        context.arena.reset();
        context.destroyed.store(true, Ordering::Relaxed);
    }

    /// Forcibly release every context owned by `scope`. Runs from the
    /// scope-exit hook; on commit a survivor means someone forgot to
    /// release, which is worth a warning before cleaning up anyway.
    pub fn cleanup_scope(&self, scope: ScopeId, committed: bool) {
        loop {
            let context = {
                let mut state = self.state.lock();
                let bucket = &mut state.buckets[hash_index(scope)];
                match bucket.iter().position(|c| c.scope == scope) {
                    Some(pos) => {
                        let context = bucket.remove(pos);
                        if state
                            .last
                            .as_ref()
                            .is_some_and(|last| Arc::ptr_eq(last, &context))
                        {
                            state.last = None;
                        }
                        Some(context)
                    }
                    None => None,
                }
            };
            let Some(context) = context else { break };
            if committed {
                warn!(
                    "probable missing release of GPU context (scope {})",
                    scope.0
                );
            }
            self.release_context(&context, committed);
        }
    }
}

struct RegistryCleanup {
    registry: Weak<GpuContextRegistry>,
}

impl ScopeExitCallback for RegistryCleanup {
    fn on_exit(&self, scope: ScopeId, phase: ReleasePhase, committed: bool) {
        if phase != ReleasePhase::AfterLocks {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.cleanup_scope(scope, committed);
        }
    }
}

fn hash_index(scope: ScopeId) -> usize {
    let hashed = scope.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (hashed >> 33) as usize % CONTEXT_HASH_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{KernelFeatures, NoopTaskOps};
    use crate::testing::{MockDevice, MockDriver};

    fn setup(devices: usize) -> (Arc<MockDriver>, Arc<GpuContextRegistry>) {
        let mocks = (0..devices)
            .map(|i| MockDevice::new(format!("dev{i}")).compute_capability(6, 1))
            .collect();
        let driver = Arc::new(MockDriver::new(mocks));
        let inventory =
            Arc::new(DeviceInventory::collect(driver.as_ref()).expect("inventory"));
        let registry = GpuContextRegistry::new(driver.clone(), inventory);
        (driver, registry)
    }

    #[test]
    fn acquire_is_idempotent_per_scope() {
        let (driver, registry) = setup(2);
        let scope = ScopeId(42);

        let a = registry.acquire(scope).expect("first");
        let b = registry.acquire(scope).expect("second");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
        assert_eq!(driver.counters().contexts_created, 2); // one per device

        registry.release(&b);
        assert_eq!(a.refcount(), 1);
        assert!(registry.contains(scope));
        assert_eq!(driver.counters().contexts_destroyed, 0);

        registry.release(&a);
        assert!(!registry.contains(scope));
        assert!(a.is_destroyed());
        assert_eq!(driver.counters().contexts_destroyed, 2);

        // the scope hook afterwards is a no-op
        registry.cleanup_scope(scope, true);
        assert_eq!(driver.counters().contexts_destroyed, 2);
    }

    #[test]
    fn distinct_scopes_get_distinct_contexts() {
        let (_driver, registry) = setup(1);
        let a = registry.acquire(ScopeId(1)).expect("a");
        let b = registry.acquire(ScopeId(2)).expect("b");
        assert!(!Arc::ptr_eq(&a, &b));
        registry.release(&a);
        registry.release(&b);
    }

    #[test]
    fn scope_exit_hook_releases_everything() {
        let (driver, registry) = setup(2);
        let scopes = ScopeManager::new();
        registry.register_cleanup(&scopes);

        let scope = scopes.enter_scope();
        let context = registry.acquire(scope).expect("acquire");
        let state = GpuTaskState::create(&context, None, KernelFeatures::GPUSCAN, None);
        let _task = state
            .create_task(driver.as_ref(), Box::new(NoopTaskOps))
            .expect("task");
        let store_released = Arc::new(AtomicBool::new(false));
        {
            let flag = store_released.clone();
            context.attach_data_store(DataStore::new(
                "pds0",
                Box::new(move || flag.store(true, Ordering::Relaxed)),
            ));
        }
        let _pinned = context.arena().store(&[0u8; 64]);

        // abort-path cleanup: silent, but everything must be released
        scopes.exit_scope(scope, false);

        assert!(!registry.contains(scope));
        assert!(context.is_destroyed());
        assert!(store_released.load(Ordering::Relaxed));
        assert_eq!(state.counts().tracked, 0);
        assert_eq!(context.arena().allocated(), 0);

        let counters = driver.counters();
        assert_eq!(counters.contexts_destroyed, counters.contexts_created);
        assert_eq!(counters.streams_destroyed, counters.streams_created);
        assert!(counters.sync_calls >= 2);
    }

    #[test]
    fn teardown_survives_driver_failures() {
        let (driver, registry) = setup(1);
        let scope = ScopeId(9);
        let context = registry.acquire(scope).expect("acquire");

        driver.fail_next_sync();
        driver.fail_context_destroy();
        registry.release(&context);

        // destroy was attempted and the context is gone despite the errors
        assert!(!registry.contains(scope));
        assert!(context.is_destroyed());
        assert_eq!(context.arena().allocated(), 0);
    }

    #[test]
    fn last_acquired_cache_is_invalidated_on_release() {
        let (_driver, registry) = setup(1);
        let a = registry.acquire(ScopeId(5)).expect("a");
        registry.release(&a);
        // a stale hint would hand back a destroyed context
        let b = registry.acquire(ScopeId(5)).expect("b");
        assert!(!b.is_destroyed());
        assert!(!Arc::ptr_eq(&a, &b));
        registry.release(&b);
    }
}
