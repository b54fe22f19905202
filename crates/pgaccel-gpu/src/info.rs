//! Device introspection rows.
//!
//! For every discovered device this yields, in order: the device name, the
//! total memory, then one row per known attribute rendered by kind.

use crate::device::DeviceInventory;
use crate::driver::{dev_attr, DeviceDriver};
use crate::error::GpuError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttrKind {
    Bool,
    Int,
    KiloBytes,
    MegaHertz,
    ComputeMode,
    Bits,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfoRow {
    pub device_id: i32,
    pub attribute: String,
    pub value: String,
}

const ATTR_CATALOG: &[(i32, &str, AttrKind)] = &[
    (dev_attr::MAX_THREADS_PER_BLOCK, "max threads per block", AttrKind::Int),
    (dev_attr::MAX_BLOCK_DIM_X, "Maximum block dimension X", AttrKind::Int),
    (dev_attr::MAX_BLOCK_DIM_Y, "Maximum block dimension Y", AttrKind::Int),
    (dev_attr::MAX_BLOCK_DIM_Z, "Maximum block dimension Z", AttrKind::Int),
    (dev_attr::MAX_GRID_DIM_X, "Maximum grid dimension X", AttrKind::Int),
    (dev_attr::MAX_GRID_DIM_Y, "Maximum grid dimension Y", AttrKind::Int),
    (dev_attr::MAX_GRID_DIM_Z, "Maximum grid dimension Z", AttrKind::Int),
    (dev_attr::MAX_SHARED_MEMORY_PER_BLOCK, "Maximum shared memory available per block", AttrKind::KiloBytes),
    (dev_attr::TOTAL_CONSTANT_MEMORY, "Memory available on device for __constant__", AttrKind::KiloBytes),
    (dev_attr::WARP_SIZE, "Warp size in threads", AttrKind::Int),
    (dev_attr::MAX_PITCH, "Maximum pitch in bytes allowed by memory copies", AttrKind::Int),
    (dev_attr::MAX_REGISTERS_PER_BLOCK, "Maximum number of 32bit registers available per block", AttrKind::Int),
    (dev_attr::CLOCK_RATE, "Typical clock frequency in kilohertz", AttrKind::MegaHertz),
    (dev_attr::TEXTURE_ALIGNMENT, "Alignment requirement for textures", AttrKind::Int),
    (dev_attr::MULTIPROCESSOR_COUNT, "Number of multiprocessors on device", AttrKind::Int),
    (dev_attr::KERNEL_EXEC_TIMEOUT, "Has kernel execution timeout", AttrKind::Bool),
    (dev_attr::INTEGRATED, "Integrated with host memory", AttrKind::Bool),
    (dev_attr::CAN_MAP_HOST_MEMORY, "Host memory can be mapped to CUDA address space", AttrKind::Bool),
    (dev_attr::COMPUTE_MODE, "Compute mode", AttrKind::ComputeMode),
    (dev_attr::SURFACE_ALIGNMENT, "Alignment requirement for surfaces", AttrKind::Int),
    (dev_attr::CONCURRENT_KERNELS, "Multiple concurrent kernel support", AttrKind::Bool),
    (dev_attr::ECC_ENABLED, "Device has ECC support enabled", AttrKind::Bool),
    (dev_attr::PCI_BUS_ID, "PCI bus ID of the device", AttrKind::Int),
    (dev_attr::PCI_DEVICE_ID, "PCI device ID of the device", AttrKind::Int),
    (dev_attr::TCC_DRIVER, "Device is using TCC driver model", AttrKind::Bool),
    (dev_attr::MEMORY_CLOCK_RATE, "Peak memory clock frequency", AttrKind::MegaHertz),
    (dev_attr::GLOBAL_MEMORY_BUS_WIDTH, "Global memory bus width", AttrKind::Bits),
    (dev_attr::L2_CACHE_SIZE, "Size of L2 cache in bytes", AttrKind::KiloBytes),
    (dev_attr::MAX_THREADS_PER_MULTIPROCESSOR, "Maximum threads per multiprocessor", AttrKind::Int),
    (dev_attr::ASYNC_ENGINE_COUNT, "Number of asynchronous engines", AttrKind::Int),
    (dev_attr::UNIFIED_ADDRESSING, "Device shares unified address space", AttrKind::Bool),
    (dev_attr::PCI_DOMAIN_ID, "PCI domain ID of the device", AttrKind::Int),
    (dev_attr::COMPUTE_CAPABILITY_MAJOR, "Major compute capability version number", AttrKind::Int),
    (dev_attr::COMPUTE_CAPABILITY_MINOR, "Minor compute capability version number", AttrKind::Int),
    (dev_attr::STREAM_PRIORITIES_SUPPORTED, "Device supports stream priorities", AttrKind::Bool),
    (dev_attr::GLOBAL_L1_CACHE_SUPPORTED, "Device supports caching globals in L1", AttrKind::Bool),
    (dev_attr::LOCAL_L1_CACHE_SUPPORTED, "Device supports caching locals in L1", AttrKind::Bool),
    (dev_attr::MAX_SHARED_MEMORY_PER_MULTIPROCESSOR, "Maximum shared memory per multiprocessor", AttrKind::KiloBytes),
    (dev_attr::MAX_REGISTERS_PER_MULTIPROCESSOR, "Maximum number of 32bit registers per multiprocessor", AttrKind::Int),
    (dev_attr::MANAGED_MEMORY, "Device can allocate managed memory on this system", AttrKind::Bool),
    (dev_attr::MULTI_GPU_BOARD, "Device is on a multi-GPU board", AttrKind::Bool),
    (dev_attr::MULTI_GPU_BOARD_GROUP_ID, "Unique id if device is on a multi-GPU board", AttrKind::Int),
];

fn render(kind: AttrKind, property: i32) -> String {
    match kind {
        AttrKind::Bool => {
            if property != 0 { "True" } else { "False" }.to_string()
        }
        AttrKind::Int => format!("{property}"),
        AttrKind::KiloBytes => format!("{} KBytes", property / 1024),
        AttrKind::MegaHertz => format!("{} MHz", property / 1000),
        AttrKind::ComputeMode => match property {
            0 => "Default".to_string(),
            1 => "Exclusive".to_string(),
            2 => "Prohibited".to_string(),
            3 => "Exclusive Process".to_string(),
            other => format!("Unknown ({other})"),
        },
        AttrKind::Bits => format!("{property} bits"),
    }
}

/// One `(device_id, attribute, value)` row per device property.
pub fn device_info_rows(
    driver: &dyn DeviceDriver,
    inventory: &DeviceInventory,
) -> Result<Vec<DeviceInfoRow>, GpuError> {
    let mut rows = Vec::with_capacity(inventory.devices.len() * (ATTR_CATALOG.len() + 2));
    for device in &inventory.devices {
        rows.push(DeviceInfoRow {
            device_id: device.ordinal,
            attribute: "Device name".to_string(),
            value: device.name.clone(),
        });
        rows.push(DeviceInfoRow {
            device_id: device.ordinal,
            attribute: "Total global memory size".to_string(),
            value: format!("{} MBytes", device.total_mem >> 20),
        });
        for &(attr, name, kind) in ATTR_CATALOG {
            let property = driver
                .device_attribute(attr, device.handle)
                .map_err(|code| GpuError::driver("cuDeviceGetAttribute", code))?;
            rows.push(DeviceInfoRow {
                device_id: device.ordinal,
                attribute: name.to_string(),
                value: render(kind, property),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInventory;
    use crate::testing::{MockDevice, MockDriver};

    #[test]
    fn rows_follow_the_catalog_order() {
        let driver = MockDriver::new(vec![MockDevice::new("Tesla P40")
            .compute_capability(6, 1)
            .total_mem(2 << 30)
            .attr(dev_attr::COMPUTE_MODE, 3)
            .attr(dev_attr::ECC_ENABLED, 1)]);
        let inventory = DeviceInventory::collect(&driver).expect("inventory");
        let rows = device_info_rows(&driver, &inventory).expect("rows");

        assert_eq!(rows.len(), ATTR_CATALOG.len() + 2);
        assert_eq!(rows[0].attribute, "Device name");
        assert_eq!(rows[0].value, "Tesla P40");
        assert_eq!(rows[1].attribute, "Total global memory size");
        assert_eq!(rows[1].value, "2048 MBytes");

        let find = |name: &str| {
            rows.iter()
                .find(|r| r.attribute == name)
                .unwrap_or_else(|| panic!("missing row {name}"))
        };
        assert_eq!(find("Warp size in threads").value, "32");
        assert_eq!(find("Maximum shared memory available per block").value, "48 KBytes");
        assert_eq!(find("Peak memory clock frequency").value, "3615 MHz");
        assert_eq!(find("Global memory bus width").value, "384 bits");
        assert_eq!(find("Compute mode").value, "Exclusive Process");
        assert_eq!(find("Device has ECC support enabled").value, "True");
        assert_eq!(find("Device is on a multi-GPU board").value, "False");
    }
}
