//! Device inventory.
//!
//! Enumerates GPUs once at startup, filters out devices older than compute
//! capability 3.0 and tracks the process-wide minima later stages rely on.
//! The retained set is immutable; collecting again is safe and yields the
//! same records.

use tracing::{info, warn};

use crate::driver::{dev_attr, DevHandle, DeviceDriver};
use crate::error::GpuError;

#[derive(Clone, Debug)]
pub struct DeviceRecord {
    pub ordinal: i32,
    pub handle: DevHandle,
    pub name: String,
    pub total_mem: usize,
    pub max_threads_per_block: i32,
    pub warp_size: i32,
    pub l2_cache_size: i32,
    pub mem_clock_khz: i32,
    pub mem_bus_width: i32,
    pub cc_major: i32,
    pub cc_minor: i32,
    pub multiprocessor_count: i32,
    pub core_clock_khz: i32,
}

impl DeviceRecord {
    /// Compute capability encoded as `100 * major + minor`.
    pub fn compute_capability(&self) -> i32 {
        100 * self.cc_major + self.cc_minor
    }
}

#[derive(Clone, Debug)]
pub struct DeviceInventory {
    pub devices: Vec<DeviceRecord>,
    /// Largest single allocation any device can take: min over devices of
    /// total/3, rounded down to 1MiB.
    pub max_malloc_size: usize,
    /// Smallest per-device max threads/block.
    pub max_threads_per_block: i32,
    /// Smallest compute capability across devices.
    pub compute_capability: i32,
}

impl DeviceInventory {
    pub fn collect(driver: &dyn DeviceDriver) -> Result<DeviceInventory, GpuError> {
        driver
            .init()
            .map_err(|code| GpuError::driver("cuInit", code))?;

        let count = driver
            .device_count()
            .map_err(|code| GpuError::driver("cuDeviceGetCount", code))?;
        if count == 0 {
            return Err(GpuError::NoDevice);
        }

        let mut devices = Vec::new();
        let mut max_malloc_size = usize::MAX;
        let mut max_threads_per_block = i32::MAX;
        let mut compute_capability = i32::MAX;

        for ordinal in 0..count {
            let record = read_device_record(driver, ordinal)?;
            let supported = record.cc_major >= 3;

            // Referenced device properties are tracked for every inspected
            // device, supported or not.
            max_malloc_size =
                max_malloc_size.min((record.total_mem / 3) & !((1usize << 20) - 1));
            max_threads_per_block = max_threads_per_block.min(record.max_threads_per_block);
            compute_capability = compute_capability.min(record.compute_capability());

            info!(
                "CUDA device[{}] {} ({} of SMs ({}MHz), L2 {}KB, RAM {}MB ({}bits, {}KHz), computing capability {}.{}{}",
                record.ordinal,
                record.name,
                record.multiprocessor_count,
                record.core_clock_khz / 1000,
                record.l2_cache_size >> 10,
                record.total_mem >> 20,
                record.mem_bus_width,
                record.mem_clock_khz / 1000,
                record.cc_major,
                record.cc_minor,
                if supported { "" } else { ", NOT SUPPORTED" },
            );

            if supported {
                devices.push(record);
            } else {
                warn!(
                    "CUDA device[{}] is excluded: compute capability {}.{} is older than 3.0",
                    record.ordinal, record.cc_major, record.cc_minor
                );
            }
        }

        if devices.is_empty() {
            return Err(GpuError::DeviceCapabilityRejected);
        }

        Ok(DeviceInventory {
            devices,
            max_malloc_size,
            max_threads_per_block,
            compute_capability,
        })
    }
}

fn read_device_record(driver: &dyn DeviceDriver, ordinal: i32) -> Result<DeviceRecord, GpuError> {
    let handle = driver
        .device_get(ordinal)
        .map_err(|code| GpuError::driver("cuDeviceGet", code))?;
    let name = driver
        .device_name(handle)
        .map_err(|code| GpuError::driver("cuDeviceGetName", code))?;
    let total_mem = driver
        .device_total_mem(handle)
        .map_err(|code| GpuError::driver("cuDeviceTotalMem", code))?;

    let attr = |attr: i32| {
        driver
            .device_attribute(attr, handle)
            .map_err(|code| GpuError::driver("cuDeviceGetAttribute", code))
    };

    Ok(DeviceRecord {
        ordinal,
        handle,
        name,
        total_mem,
        max_threads_per_block: attr(dev_attr::MAX_THREADS_PER_BLOCK)?,
        warp_size: attr(dev_attr::WARP_SIZE)?,
        l2_cache_size: attr(dev_attr::L2_CACHE_SIZE)?,
        mem_clock_khz: attr(dev_attr::MEMORY_CLOCK_RATE)?,
        mem_bus_width: attr(dev_attr::GLOBAL_MEMORY_BUS_WIDTH)?,
        cc_major: attr(dev_attr::COMPUTE_CAPABILITY_MAJOR)?,
        cc_minor: attr(dev_attr::COMPUTE_CAPABILITY_MINOR)?,
        multiprocessor_count: attr(dev_attr::MULTIPROCESSOR_COUNT)?,
        core_clock_khz: attr(dev_attr::CLOCK_RATE)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDevice, MockDriver};

    #[test]
    fn collect_filters_old_devices() {
        let driver = MockDriver::new(vec![
            MockDevice::new("GTX 680").compute_capability(3, 0),
            MockDevice::new("Tesla C2050").compute_capability(2, 0),
        ]);
        let inventory = DeviceInventory::collect(&driver).expect("inventory");
        assert_eq!(inventory.devices.len(), 1);
        assert_eq!(inventory.devices[0].name, "GTX 680");
    }

    #[test]
    fn collect_tracks_minima() {
        let driver = MockDriver::new(vec![
            MockDevice::new("A")
                .total_mem(12 << 30)
                .max_threads_per_block(1024)
                .compute_capability(6, 1),
            MockDevice::new("B")
                .total_mem(6 << 30)
                .max_threads_per_block(512)
                .compute_capability(3, 5),
        ]);
        let inventory = DeviceInventory::collect(&driver).expect("inventory");
        assert_eq!(inventory.max_threads_per_block, 512);
        assert_eq!(inventory.compute_capability, 305);
        // 2GiB, already 1MiB aligned
        assert_eq!(inventory.max_malloc_size, (6usize << 30) / 3);
    }

    #[test]
    fn no_device_is_fatal() {
        let driver = MockDriver::new(vec![]);
        assert!(matches!(
            DeviceInventory::collect(&driver),
            Err(GpuError::NoDevice)
        ));
    }

    #[test]
    fn all_rejected_is_fatal() {
        let driver =
            MockDriver::new(vec![MockDevice::new("Tesla C2050").compute_capability(2, 0)]);
        assert!(matches!(
            DeviceInventory::collect(&driver),
            Err(GpuError::DeviceCapabilityRejected)
        ));
    }
}
