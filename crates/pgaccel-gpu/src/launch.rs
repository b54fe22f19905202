//! Launch geometry planner.
//!
//! Computes (grid, block) for a compiled kernel; it never launches anything.
//! Dynamic shared memory is always expressed as an explicit function of the
//! block size, so the occupancy path carries no hidden state.

use crate::device::DeviceInventory;
use crate::driver::{dev_attr, func_attr, DevFunction, DevHandle, DeviceDriver};
use crate::error::GpuError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub grid_size: u32,
    pub block_size: u32,
}

/// Pick the workgroup geometry for `nitems` work items.
///
/// With `maximum_blocksize` the kernel's own max threads/block is shrunk one
/// thread at a time until static plus dynamic shared memory fits the device;
/// otherwise the driver's occupancy calculator is consulted with the dynamic
/// shared-memory demand `|bs| dynamic_shmem_per_thread * bs`, bounded by the
/// process-wide threads/block minimum.
pub fn compute_workgroup_size(
    driver: &dyn DeviceDriver,
    function: DevFunction,
    device: DevHandle,
    maximum_blocksize: bool,
    nitems: usize,
    dynamic_shmem_per_thread: usize,
    inventory: &DeviceInventory,
) -> Result<LaunchGeometry, GpuError> {
    let static_shmem = driver
        .func_attribute(func_attr::SHARED_SIZE_BYTES, function)
        .map_err(|code| GpuError::driver("cuFuncGetAttribute", code))? as usize;
    let kernel_max = driver
        .func_attribute(func_attr::MAX_THREADS_PER_BLOCK, function)
        .map_err(|code| GpuError::driver("cuFuncGetAttribute", code))?;
    let warp_size = driver
        .device_attribute(dev_attr::WARP_SIZE, device)
        .map_err(|code| GpuError::driver("cuDeviceGetAttribute", code))?;

    if maximum_blocksize {
        let max_shmem = driver
            .device_attribute(dev_attr::MAX_SHARED_MEMORY_PER_BLOCK, device)
            .map_err(|code| GpuError::driver("cuDeviceGetAttribute", code))?
            as usize;

        let mut block_size = kernel_max;
        while block_size > 0
            && static_shmem + dynamic_shmem_per_thread * block_size as usize > max_shmem
        {
            block_size -= 1;
        }
        if block_size < warp_size {
            // shrunk below a warp: shared memory is the limiting factor
            if block_size < kernel_max {
                return Err(GpuError::ShmemTooLarge {
                    required: static_shmem + dynamic_shmem_per_thread * warp_size as usize,
                    available: max_shmem,
                });
            }
            return Err(GpuError::GeometryTooSmall { block_size });
        }
        Ok(LaunchGeometry {
            grid_size: grid_for(nitems, block_size as u32),
            block_size: block_size as u32,
        })
    } else {
        let dynamic_shmem = |block_size: i32| dynamic_shmem_per_thread * block_size as usize;
        occupancy_geometry(
            driver,
            function,
            device,
            nitems,
            kernel_max.min(inventory.max_threads_per_block),
            warp_size,
            &dynamic_shmem,
        )
    }
}

/// Scan warp-multiple block sizes and keep the one the occupancy calculator
/// says carries the most resident threads per multiprocessor.
fn occupancy_geometry(
    driver: &dyn DeviceDriver,
    function: DevFunction,
    device: DevHandle,
    nitems: usize,
    block_size_limit: i32,
    warp_size: i32,
    dynamic_shmem: &dyn Fn(i32) -> usize,
) -> Result<LaunchGeometry, GpuError> {
    let mut best: Option<(i64, i32, i32)> = None; // (resident threads, block, blocks/SM)

    let mut block_size = warp_size;
    while block_size <= block_size_limit {
        let blocks = driver
            .occupancy_max_active_blocks(function, block_size, dynamic_shmem(block_size))
            .map_err(|code| {
                GpuError::driver("cuOccupancyMaxActiveBlocksPerMultiprocessor", code)
            })?;
        let resident = blocks as i64 * block_size as i64;
        if blocks > 0 && best.map_or(true, |(r, _, _)| resident >= r) {
            best = Some((resident, block_size, blocks));
        }
        block_size += warp_size;
    }

    let Some((_, block_size, blocks_per_sm)) = best else {
        return Err(GpuError::GeometryTooSmall { block_size: 0 });
    };

    let sm_count = driver
        .device_attribute(dev_attr::MULTIPROCESSOR_COUNT, device)
        .map_err(|code| GpuError::driver("cuDeviceGetAttribute", code))?;
    let fill_grid = (blocks_per_sm as i64 * sm_count as i64).max(1) as u32;

    Ok(LaunchGeometry {
        grid_size: fill_grid.max(grid_for(nitems, block_size as u32)),
        block_size: block_size as u32,
    })
}

fn grid_for(nitems: usize, block_size: u32) -> u32 {
    (nitems.div_ceil(block_size as usize)).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInventory;
    use crate::testing::{MockDevice, MockDriver};

    fn setup() -> (MockDriver, DeviceInventory) {
        let driver = MockDriver::new(vec![MockDevice::new("Tesla P40")
            .compute_capability(6, 1)
            .max_threads_per_block(1024)
            .shared_per_block(48 << 10)]);
        let inventory = DeviceInventory::collect(&driver).expect("inventory");
        (driver, inventory)
    }

    #[test]
    fn maximize_mode_respects_shared_memory() {
        let (driver, inventory) = setup();
        let device = inventory.devices[0].handle;
        let function = driver.define_kernel(1024, 1 << 10); // 1KB static

        // 64B/thread: (48K - 1K) / 64 = 752 threads fit exactly
        let geometry = compute_workgroup_size(
            &driver, function, device, true, 100_000, 64, &inventory,
        )
        .expect("geometry");
        assert_eq!(geometry.block_size, 752);
        assert_eq!(geometry.grid_size, 100_000u32.div_ceil(752));

        // property bounds: B >= warp, B <= kernel max, static + S*B <= device max
        assert!(geometry.block_size >= 32);
        assert!(geometry.block_size <= 1024);
        assert!((1 << 10) + 64 * geometry.block_size as usize <= 48 << 10);
        assert!(geometry.grid_size as u64 * geometry.block_size as u64 >= 100_000);
    }

    #[test]
    fn maximize_mode_rejects_tiny_blocks() {
        let (driver, inventory) = setup();
        let device = inventory.devices[0].handle;
        let function = driver.define_kernel(1024, 0);

        // 2KB/thread cannot fit even a single warp
        let err = compute_workgroup_size(
            &driver, function, device, true, 1024, 2 << 10, &inventory,
        )
        .expect_err("must fail");
        assert!(matches!(err, GpuError::ShmemTooLarge { .. }));

        // a kernel limited to fewer threads than a warp can never launch
        let function = driver.define_kernel(16, 0);
        let err = compute_workgroup_size(&driver, function, device, true, 1024, 0, &inventory)
            .expect_err("must fail");
        assert!(matches!(err, GpuError::GeometryTooSmall { .. }));
    }

    #[test]
    fn occupancy_mode_covers_nitems() {
        let (driver, inventory) = setup();
        let device = inventory.devices[0].handle;
        let function = driver.define_kernel(1024, 0);

        let geometry = compute_workgroup_size(
            &driver, function, device, false, 1_000_000, 16, &inventory,
        )
        .expect("geometry");
        assert_eq!(geometry.block_size % 32, 0);
        assert!(geometry.block_size <= 1024);
        assert!(geometry.grid_size as u64 * geometry.block_size as u64 >= 1_000_000);
    }
}
