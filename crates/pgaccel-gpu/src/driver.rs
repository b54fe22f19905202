//! The narrow seam between this crate and the device driver.
//!
//! Handles are opaque u64 tokens rather than raw pointers so registry and
//! planner logic stays independent of how a concrete driver represents them.

use std::path::Path;

/// Raw driver status code (CUresult-compatible).
pub type DriverCode = i32;

pub const DRIVER_SUCCESS: DriverCode = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevHandle(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevContext(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevStream(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevModule(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevFunction(pub u64);

/// Device attribute identifiers this crate consumes (CU_DEVICE_ATTRIBUTE_*).
pub mod dev_attr {
    pub const MAX_THREADS_PER_BLOCK: i32 = 1;
    pub const MAX_BLOCK_DIM_X: i32 = 2;
    pub const MAX_BLOCK_DIM_Y: i32 = 3;
    pub const MAX_BLOCK_DIM_Z: i32 = 4;
    pub const MAX_GRID_DIM_X: i32 = 5;
    pub const MAX_GRID_DIM_Y: i32 = 6;
    pub const MAX_GRID_DIM_Z: i32 = 7;
    pub const MAX_SHARED_MEMORY_PER_BLOCK: i32 = 8;
    pub const TOTAL_CONSTANT_MEMORY: i32 = 9;
    pub const WARP_SIZE: i32 = 10;
    pub const MAX_PITCH: i32 = 11;
    pub const MAX_REGISTERS_PER_BLOCK: i32 = 12;
    pub const CLOCK_RATE: i32 = 13;
    pub const TEXTURE_ALIGNMENT: i32 = 14;
    pub const MULTIPROCESSOR_COUNT: i32 = 16;
    pub const KERNEL_EXEC_TIMEOUT: i32 = 17;
    pub const INTEGRATED: i32 = 18;
    pub const CAN_MAP_HOST_MEMORY: i32 = 19;
    pub const COMPUTE_MODE: i32 = 20;
    pub const SURFACE_ALIGNMENT: i32 = 30;
    pub const CONCURRENT_KERNELS: i32 = 31;
    pub const ECC_ENABLED: i32 = 32;
    pub const PCI_BUS_ID: i32 = 33;
    pub const PCI_DEVICE_ID: i32 = 34;
    pub const TCC_DRIVER: i32 = 35;
    pub const MEMORY_CLOCK_RATE: i32 = 36;
    pub const GLOBAL_MEMORY_BUS_WIDTH: i32 = 37;
    pub const L2_CACHE_SIZE: i32 = 38;
    pub const MAX_THREADS_PER_MULTIPROCESSOR: i32 = 39;
    pub const ASYNC_ENGINE_COUNT: i32 = 40;
    pub const UNIFIED_ADDRESSING: i32 = 41;
    pub const PCI_DOMAIN_ID: i32 = 50;
    pub const COMPUTE_CAPABILITY_MAJOR: i32 = 75;
    pub const COMPUTE_CAPABILITY_MINOR: i32 = 76;
    pub const STREAM_PRIORITIES_SUPPORTED: i32 = 78;
    pub const GLOBAL_L1_CACHE_SUPPORTED: i32 = 79;
    pub const LOCAL_L1_CACHE_SUPPORTED: i32 = 80;
    pub const MAX_SHARED_MEMORY_PER_MULTIPROCESSOR: i32 = 81;
    pub const MAX_REGISTERS_PER_MULTIPROCESSOR: i32 = 82;
    pub const MANAGED_MEMORY: i32 = 83;
    pub const MULTI_GPU_BOARD: i32 = 84;
    pub const MULTI_GPU_BOARD_GROUP_ID: i32 = 85;
}

/// Function attribute identifiers (CU_FUNC_ATTRIBUTE_*).
pub mod func_attr {
    pub const MAX_THREADS_PER_BLOCK: i32 = 0;
    pub const SHARED_SIZE_BYTES: i32 = 1;
    pub const CONST_SIZE_BYTES: i32 = 2;
    pub const LOCAL_SIZE_BYTES: i32 = 3;
    pub const NUM_REGS: i32 = 4;
}

/// Operations the context registry, inventory, planner and task tracker need
/// from a driver. Implemented by [`crate::cuda::CudaDriver`] for real
/// hardware and by [`crate::testing::MockDriver`] for tests.
pub trait DeviceDriver: Send + Sync {
    fn init(&self) -> Result<(), DriverCode>;

    fn device_count(&self) -> Result<i32, DriverCode>;
    fn device_get(&self, ordinal: i32) -> Result<DevHandle, DriverCode>;
    fn device_name(&self, dev: DevHandle) -> Result<String, DriverCode>;
    fn device_total_mem(&self, dev: DevHandle) -> Result<usize, DriverCode>;
    fn device_attribute(&self, attr: i32, dev: DevHandle) -> Result<i32, DriverCode>;

    fn ctx_create(&self, dev: DevHandle) -> Result<DevContext, DriverCode>;
    fn ctx_destroy(&self, ctx: DevContext) -> Result<(), DriverCode>;
    fn ctx_set_current(&self, ctx: Option<DevContext>) -> Result<(), DriverCode>;
    /// Block until every operation queued on the current context completes.
    fn ctx_synchronize(&self) -> Result<(), DriverCode>;

    fn stream_create_non_blocking(&self) -> Result<DevStream, DriverCode>;
    fn stream_destroy(&self, stream: DevStream) -> Result<(), DriverCode>;

    fn module_load(&self, path: &Path) -> Result<DevModule, DriverCode>;
    fn module_unload(&self, module: DevModule) -> Result<(), DriverCode>;
    fn module_get_function(&self, module: DevModule, name: &str)
        -> Result<DevFunction, DriverCode>;

    fn func_attribute(&self, attr: i32, func: DevFunction) -> Result<i32, DriverCode>;

    /// Occupancy calculator: resident blocks per multiprocessor for the given
    /// block size and dynamic shared-memory demand.
    fn occupancy_max_active_blocks(
        &self,
        func: DevFunction,
        block_size: i32,
        dynamic_smem: usize,
    ) -> Result<i32, DriverCode>;

    /// Symbolic name of a driver status code, when the driver knows it.
    fn error_name(&self, code: DriverCode) -> Option<String> {
        let _ = code;
        None
    }

    /// Human-readable description of a driver status code.
    fn error_string(&self, code: DriverCode) -> Option<String> {
        let _ = code;
        None
    }
}
