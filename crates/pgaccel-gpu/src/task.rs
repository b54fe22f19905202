//! Task-states and tasks.
//!
//! A task-state is the per-operator record inside a plan: it owns the tasks
//! the operator has in flight and, optionally, the compiled module they run
//! from. Tasks move through pending/running/completed under the task-state's
//! own lock; the tracked list holds them from creation to release.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use pgaccel_core::CoreError;

use crate::context::GpuContext;
use crate::driver::{DevContext, DevHandle, DevModule, DevStream, DeviceDriver};
use crate::error::GpuError;

bitflags::bitflags! {
    /// Device-kernel features an operator's generated source depends on.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct KernelFeatures: u32 {
        const GPUSCAN   = 1 << 0;
        const GPUJOIN   = 1 << 1;
        const GPUPREAGG = 1 << 2;
        const GPUSORT   = 1 << 3;
        const PLGPU     = 1 << 4;
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskPhase {
    Created,
    Pending,
    Running,
    Completed,
}

/// Per-task callbacks supplied by the owning operator.
pub trait TaskOps: Send {
    fn process(&mut self, task: TaskId) {
        let _ = task;
    }
    fn release(&mut self, task: TaskId) {
        let _ = task;
    }
}

/// A no-op callback set, for tasks whose cleanup is entirely stream-bound.
pub struct NoopTaskOps;

impl TaskOps for NoopTaskOps {}

pub struct GpuTask {
    pub id: TaskId,
    pub stream: DevStream,
    pub device: DevHandle,
    pub sub_context: DevContext,
    phase: TaskPhase,
    ops: Box<dyn TaskOps>,
}

#[derive(Default)]
struct TaskLists {
    tracked: Vec<GpuTask>,
    pending: Vec<TaskId>,
    running: Vec<TaskId>,
    completed: Vec<TaskId>,
}

impl TaskLists {
    fn scheduling_list(&mut self, phase: TaskPhase) -> Option<&mut Vec<TaskId>> {
        match phase {
            TaskPhase::Created => None,
            TaskPhase::Pending => Some(&mut self.pending),
            TaskPhase::Running => Some(&mut self.running),
            TaskPhase::Completed => Some(&mut self.completed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub tracked: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
}

pub struct GpuTaskState {
    context: Weak<GpuContext>,
    pub features: KernelFeatures,
    kern_source: Option<String>,
    module: Mutex<Option<DevModule>>,
    lists: Mutex<TaskLists>,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl GpuTaskState {
    /// Create a task-state inside `context`. The state is linked onto the
    /// context's list so context drain can cascade into it.
    pub fn create(
        context: &Arc<GpuContext>,
        kern_source: Option<String>,
        features: KernelFeatures,
        cleanup: Option<Box<dyn FnOnce() + Send>>,
    ) -> Arc<GpuTaskState> {
        let state = Arc::new(GpuTaskState {
            context: Arc::downgrade(context),
            features,
            kern_source,
            module: Mutex::new(None),
            lists: Mutex::new(TaskLists::default()),
            cleanup: Mutex::new(cleanup),
        });
        context.attach_task_state(state.clone());
        state
    }

    pub fn kern_source(&self) -> Option<&str> {
        self.kern_source.as_deref()
    }

    /// Attach the compiled module once the compile cache produced it.
    pub fn attach_module(&self, module: DevModule) {
        *self.module.lock() = Some(module);
    }

    pub fn module(&self) -> Option<DevModule> {
        *self.module.lock()
    }

    /// Create a task bound to the next sub-context in round-robin order,
    /// with a fresh non-blocking stream, and insert it into `tracked`.
    pub fn create_task(
        &self,
        driver: &dyn DeviceDriver,
        ops: Box<dyn TaskOps>,
    ) -> Result<TaskId, GpuError> {
        let context = self.context.upgrade().ok_or_else(|| {
            GpuError::Core(CoreError::Corrupt(
                "task-state outlived its GPU context".into(),
            ))
        })?;
        let (device, sub_context) = context.next_sub_context();

        driver
            .ctx_set_current(Some(sub_context))
            .map_err(|code| GpuError::driver("cuCtxSetCurrent", code))?;
        let stream = driver
            .stream_create_non_blocking()
            .map_err(|code| GpuError::driver("cuStreamCreate", code))?;

        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let task = GpuTask {
            id,
            stream,
            device,
            sub_context,
            phase: TaskPhase::Created,
            ops,
        };
        self.lists.lock().tracked.push(task);
        Ok(id)
    }

    pub fn enqueue_task(&self, id: TaskId) {
        self.transition(id, TaskPhase::Created, TaskPhase::Pending);
    }

    pub fn start_task(&self, id: TaskId) {
        self.transition(id, TaskPhase::Pending, TaskPhase::Running);
    }

    pub fn complete_task(&self, id: TaskId) {
        self.transition(id, TaskPhase::Running, TaskPhase::Completed);
    }

    fn transition(&self, id: TaskId, from: TaskPhase, to: TaskPhase) {
        let mut lists = self.lists.lock();
        let pos = lists
            .tracked
            .iter()
            .position(|t| t.id == id)
            .unwrap_or_else(|| panic!("task {} is not tracked here", id.0));
        debug_assert_eq!(lists.tracked[pos].phase, from, "illegal task transition");
        lists.tracked[pos].phase = to;
        if let Some(list) = lists.scheduling_list(from) {
            list.retain(|&t| t != id);
        }
        if let Some(list) = lists.scheduling_list(to) {
            list.push(id);
        }
    }

    /// Release a task from any phase: run its release callback, destroy its
    /// stream and drop it from every list. Returns false when unknown.
    pub fn release_task(&self, driver: &dyn DeviceDriver, id: TaskId) -> bool {
        let task = {
            let mut lists = self.lists.lock();
            let Some(pos) = lists.tracked.iter().position(|t| t.id == id) else {
                return false;
            };
            let task = lists.tracked.remove(pos);
            if let Some(list) = lists.scheduling_list(task.phase) {
                list.retain(|&t| t != id);
            }
            task
        };
        let mut task = task;
        task.ops.release(id);
        if let Err(code) = driver.stream_destroy(task.stream) {
            warn!(
                "failed on cuStreamDestroy: {}",
                crate::errtext::error_text_with(driver, code)
            );
        }
        true
    }

    pub fn counts(&self) -> TaskCounts {
        let lists = self.lists.lock();
        TaskCounts {
            tracked: lists.tracked.len(),
            pending: lists.pending.len(),
            running: lists.running.len(),
            completed: lists.completed.len(),
        }
    }

    /// Cascade release during context drain. Every surviving task is
    /// released regardless of its list; on the commit path each one is a
    /// reported leak.
    pub(crate) fn drain(&self, driver: &dyn DeviceDriver, is_commit: bool) {
        if let Some(module) = self.module.lock().take() {
            if let Err(code) = driver.module_unload(module) {
                warn!(
                    "failed on cuModuleUnload: {}",
                    crate::errtext::error_text_with(driver, code)
                );
            }
        }

        let survivors: Vec<TaskId> = {
            let lists = self.lists.lock();
            lists.tracked.iter().map(|t| t.id).collect()
        };
        for id in survivors {
            if is_commit {
                warn!("unreferenced GPU task leak: {}", id.0);
            }
            self.release_task(driver, id);
        }

        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }

        let counts = self.counts();
        debug_assert_eq!(counts, TaskCounts::default(), "task lists not drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GpuContextRegistry;
    use crate::device::DeviceInventory;
    use crate::testing::{MockDevice, MockDriver};
    use pgaccel_core::scope::ScopeId;

    fn registry() -> (Arc<MockDriver>, Arc<GpuContextRegistry>) {
        let driver = Arc::new(MockDriver::new(vec![
            MockDevice::new("dev0").compute_capability(6, 1),
            MockDevice::new("dev1").compute_capability(6, 1),
        ]));
        let inventory =
            Arc::new(DeviceInventory::collect(driver.as_ref()).expect("inventory"));
        let registry = GpuContextRegistry::new(driver.clone(), inventory);
        (driver, registry)
    }

    #[test]
    fn tasks_walk_the_state_machine() {
        let (driver, registry) = registry();
        let context = registry.acquire(ScopeId(1)).expect("acquire");
        let state = GpuTaskState::create(&context, None, KernelFeatures::GPUSCAN, None);

        let a = state
            .create_task(driver.as_ref(), Box::new(NoopTaskOps))
            .expect("task");
        let b = state
            .create_task(driver.as_ref(), Box::new(NoopTaskOps))
            .expect("task");

        // round-robin binding alternates sub-contexts
        assert_eq!(driver.counters().streams_created, 2);

        state.enqueue_task(a);
        state.enqueue_task(b);
        state.start_task(a);
        assert_eq!(
            state.counts(),
            TaskCounts { tracked: 2, pending: 1, running: 1, completed: 0 }
        );

        state.complete_task(a);
        assert!(state.release_task(driver.as_ref(), a));
        assert!(state.release_task(driver.as_ref(), b));
        assert_eq!(state.counts(), TaskCounts::default());
        assert_eq!(driver.counters().streams_destroyed, 2);

        registry.release(&context);
    }

    #[test]
    fn release_runs_callback_once() {
        struct Counting(Arc<AtomicU64>);
        impl TaskOps for Counting {
            fn release(&mut self, _task: TaskId) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (driver, registry) = registry();
        let context = registry.acquire(ScopeId(7)).expect("acquire");
        let state = GpuTaskState::create(&context, None, KernelFeatures::empty(), None);
        let released = Arc::new(AtomicU64::new(0));
        let id = state
            .create_task(driver.as_ref(), Box::new(Counting(released.clone())))
            .expect("task");

        assert!(state.release_task(driver.as_ref(), id));
        assert!(!state.release_task(driver.as_ref(), id));
        assert_eq!(released.load(Ordering::Relaxed), 1);

        registry.release(&context);
    }
}
