//! Scriptable in-memory driver for tests.
//!
//! Mirrors the behavioral contract of [`crate::cuda::CudaDriver`] closely
//! enough for the registry, planner and tracker to be exercised on machines
//! without a GPU: handles are validated, streams need a current context, and
//! failures can be injected for the teardown paths.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::driver::{
    dev_attr, func_attr, DevContext, DevFunction, DevHandle, DevModule, DevStream, DeviceDriver,
    DriverCode,
};

const ERROR_INVALID_DEVICE: DriverCode = 101;
const ERROR_INVALID_CONTEXT: DriverCode = 201;
const ERROR_INVALID_HANDLE: DriverCode = 400;
const ERROR_ILLEGAL_ADDRESS: DriverCode = 700;

// Per-multiprocessor limits backing the occupancy model.
const SM_MAX_THREADS: i64 = 2048;
const SM_MAX_BLOCKS: i64 = 16;
const SM_SHARED_MEMORY: i64 = 96 << 10;
const BLOCK_SHARED_MEMORY: i64 = 48 << 10;

#[derive(Clone, Debug)]
pub struct MockDevice {
    pub name: String,
    pub total_mem: usize,
    attrs: HashMap<i32, i32>,
}

impl MockDevice {
    pub fn new(name: impl Into<String>) -> MockDevice {
        MockDevice {
            name: name.into(),
            total_mem: 8 << 30,
            attrs: HashMap::new(),
        }
    }

    pub fn total_mem(mut self, bytes: usize) -> MockDevice {
        self.total_mem = bytes;
        self
    }

    pub fn compute_capability(mut self, major: i32, minor: i32) -> MockDevice {
        self.attrs.insert(dev_attr::COMPUTE_CAPABILITY_MAJOR, major);
        self.attrs.insert(dev_attr::COMPUTE_CAPABILITY_MINOR, minor);
        self
    }

    pub fn max_threads_per_block(mut self, threads: i32) -> MockDevice {
        self.attrs.insert(dev_attr::MAX_THREADS_PER_BLOCK, threads);
        self
    }

    pub fn shared_per_block(mut self, bytes: i32) -> MockDevice {
        self.attrs
            .insert(dev_attr::MAX_SHARED_MEMORY_PER_BLOCK, bytes);
        self
    }

    pub fn attr(mut self, attr: i32, value: i32) -> MockDevice {
        self.attrs.insert(attr, value);
        self
    }

    fn attribute(&self, attr: i32) -> i32 {
        if let Some(&value) = self.attrs.get(&attr) {
            return value;
        }
        match attr {
            dev_attr::MAX_THREADS_PER_BLOCK => 1024,
            dev_attr::WARP_SIZE => 32,
            dev_attr::MAX_SHARED_MEMORY_PER_BLOCK => 48 << 10,
            dev_attr::TOTAL_CONSTANT_MEMORY => 64 << 10,
            dev_attr::L2_CACHE_SIZE => 4 << 20,
            dev_attr::MEMORY_CLOCK_RATE => 3_615_000,
            dev_attr::GLOBAL_MEMORY_BUS_WIDTH => 384,
            dev_attr::MULTIPROCESSOR_COUNT => 28,
            dev_attr::CLOCK_RATE => 1_303_000,
            dev_attr::MAX_THREADS_PER_MULTIPROCESSOR => SM_MAX_THREADS as i32,
            dev_attr::MAX_SHARED_MEMORY_PER_MULTIPROCESSOR => SM_SHARED_MEMORY as i32,
            dev_attr::COMPUTE_CAPABILITY_MAJOR => 6,
            dev_attr::COMPUTE_CAPABILITY_MINOR => 1,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MockCounters {
    pub contexts_created: u64,
    pub contexts_destroyed: u64,
    pub streams_created: u64,
    pub streams_destroyed: u64,
    pub modules_loaded: u64,
    pub modules_unloaded: u64,
    pub sync_calls: u64,
    pub set_current_calls: u64,
}

struct MockKernel {
    max_threads: i32,
    static_shmem: usize,
}

pub struct MockDriver {
    devices: Vec<MockDevice>,
    counters: Mutex<MockCounters>,
    kernels: Mutex<HashMap<u64, MockKernel>>,
    live_contexts: Mutex<HashSet<u64>>,
    current_context: Mutex<Option<u64>>,
    live_streams: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
    fail_next_sync: AtomicBool,
    fail_ctx_destroy: AtomicBool,
}

impl MockDriver {
    pub fn new(devices: Vec<MockDevice>) -> MockDriver {
        MockDriver {
            devices,
            counters: Mutex::new(MockCounters::default()),
            kernels: Mutex::new(HashMap::new()),
            live_contexts: Mutex::new(HashSet::new()),
            current_context: Mutex::new(None),
            live_streams: Mutex::new(HashSet::new()),
            next_handle: AtomicU64::new(1),
            fail_next_sync: AtomicBool::new(false),
            fail_ctx_destroy: AtomicBool::new(false),
        }
    }

    pub fn counters(&self) -> MockCounters {
        *self.counters.lock()
    }

    /// Register a kernel shape for the planner tests.
    pub fn define_kernel(&self, max_threads: i32, static_shmem: usize) -> DevFunction {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.kernels.lock().insert(
            handle,
            MockKernel {
                max_threads,
                static_shmem,
            },
        );
        DevFunction(handle)
    }

    /// The next ctx_synchronize call fails with an illegal-address error.
    pub fn fail_next_sync(&self) {
        self.fail_next_sync.store(true, Ordering::Relaxed);
    }

    /// Every following ctx_destroy call fails with an invalid-context error.
    pub fn fail_context_destroy(&self) {
        self.fail_ctx_destroy.store(true, Ordering::Relaxed);
    }

    fn device(&self, dev: DevHandle) -> Result<&MockDevice, DriverCode> {
        self.devices
            .get(dev.0 as usize)
            .ok_or(ERROR_INVALID_DEVICE)
    }
}

impl DeviceDriver for MockDriver {
    fn init(&self) -> Result<(), DriverCode> {
        Ok(())
    }

    fn device_count(&self) -> Result<i32, DriverCode> {
        Ok(self.devices.len() as i32)
    }

    fn device_get(&self, ordinal: i32) -> Result<DevHandle, DriverCode> {
        if (ordinal as usize) < self.devices.len() {
            Ok(DevHandle(ordinal))
        } else {
            Err(ERROR_INVALID_DEVICE)
        }
    }

    fn device_name(&self, dev: DevHandle) -> Result<String, DriverCode> {
        Ok(self.device(dev)?.name.clone())
    }

    fn device_total_mem(&self, dev: DevHandle) -> Result<usize, DriverCode> {
        Ok(self.device(dev)?.total_mem)
    }

    fn device_attribute(&self, attr: i32, dev: DevHandle) -> Result<i32, DriverCode> {
        Ok(self.device(dev)?.attribute(attr))
    }

    fn ctx_create(&self, dev: DevHandle) -> Result<DevContext, DriverCode> {
        self.device(dev)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.live_contexts.lock().insert(handle);
        self.counters.lock().contexts_created += 1;
        Ok(DevContext(handle))
    }

    fn ctx_destroy(&self, ctx: DevContext) -> Result<(), DriverCode> {
        if self.fail_ctx_destroy.load(Ordering::Relaxed) {
            return Err(ERROR_INVALID_CONTEXT);
        }
        if !self.live_contexts.lock().remove(&ctx.0) {
            return Err(ERROR_INVALID_CONTEXT);
        }
        self.counters.lock().contexts_destroyed += 1;
        Ok(())
    }

    fn ctx_set_current(&self, ctx: Option<DevContext>) -> Result<(), DriverCode> {
        self.counters.lock().set_current_calls += 1;
        match ctx {
            Some(ctx) if !self.live_contexts.lock().contains(&ctx.0) => {
                Err(ERROR_INVALID_CONTEXT)
            }
            Some(ctx) => {
                *self.current_context.lock() = Some(ctx.0);
                Ok(())
            }
            None => {
                *self.current_context.lock() = None;
                Ok(())
            }
        }
    }

    fn ctx_synchronize(&self) -> Result<(), DriverCode> {
        if self.fail_next_sync.swap(false, Ordering::Relaxed) {
            return Err(ERROR_ILLEGAL_ADDRESS);
        }
        self.counters.lock().sync_calls += 1;
        Ok(())
    }

    fn stream_create_non_blocking(&self) -> Result<DevStream, DriverCode> {
        if self.current_context.lock().is_none() {
            return Err(ERROR_INVALID_CONTEXT);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.live_streams.lock().insert(handle);
        self.counters.lock().streams_created += 1;
        Ok(DevStream(handle))
    }

    fn stream_destroy(&self, stream: DevStream) -> Result<(), DriverCode> {
        if !self.live_streams.lock().remove(&stream.0) {
            return Err(ERROR_INVALID_HANDLE);
        }
        self.counters.lock().streams_destroyed += 1;
        Ok(())
    }

    fn module_load(&self, _path: &Path) -> Result<DevModule, DriverCode> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.counters.lock().modules_loaded += 1;
        Ok(DevModule(handle))
    }

    fn module_unload(&self, _module: DevModule) -> Result<(), DriverCode> {
        self.counters.lock().modules_unloaded += 1;
        Ok(())
    }

    fn module_get_function(
        &self,
        _module: DevModule,
        _name: &str,
    ) -> Result<DevFunction, DriverCode> {
        Ok(self.define_kernel(1024, 0))
    }

    fn func_attribute(&self, attr: i32, func: DevFunction) -> Result<i32, DriverCode> {
        let kernels = self.kernels.lock();
        let kernel = kernels.get(&func.0).ok_or(ERROR_INVALID_HANDLE)?;
        Ok(match attr {
            func_attr::MAX_THREADS_PER_BLOCK => kernel.max_threads,
            func_attr::SHARED_SIZE_BYTES => kernel.static_shmem as i32,
            func_attr::NUM_REGS => 32,
            _ => 0,
        })
    }

    fn occupancy_max_active_blocks(
        &self,
        func: DevFunction,
        block_size: i32,
        dynamic_smem: usize,
    ) -> Result<i32, DriverCode> {
        let kernels = self.kernels.lock();
        let kernel = kernels.get(&func.0).ok_or(ERROR_INVALID_HANDLE)?;
        if block_size <= 0 || block_size > kernel.max_threads {
            return Ok(0);
        }
        let shmem = kernel.static_shmem as i64 + dynamic_smem as i64;
        if shmem > BLOCK_SHARED_MEMORY {
            return Ok(0);
        }
        let by_threads = SM_MAX_THREADS / block_size as i64;
        let by_shmem = if shmem > 0 { SM_SHARED_MEMORY / shmem } else { SM_MAX_BLOCKS };
        Ok(SM_MAX_BLOCKS.min(by_threads).min(by_shmem) as i32)
    }

    fn error_name(&self, code: DriverCode) -> Option<String> {
        crate::errtext::builtin_driver_error(code).map(|(name, _)| name.to_string())
    }

    fn error_string(&self, code: DriverCode) -> Option<String> {
        crate::errtext::builtin_driver_error(code).map(|(_, desc)| desc.to_string())
    }
}
