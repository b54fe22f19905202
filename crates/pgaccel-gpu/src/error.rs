use pgaccel_core::CoreError;

use crate::driver::DriverCode;
use crate::errtext::{error_text, StromCode};

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no CUDA device found on the system")]
    NoDevice,

    #[error("no CUDA device with supported compute capability (3.0 or later)")]
    DeviceCapabilityRejected,

    #[error("failed on {call}: {}", error_text(*.code))]
    Driver { call: &'static str, code: DriverCode },

    #[error("expected block size is too small ({block_size})")]
    GeometryTooSmall { block_size: i32 },

    #[error("dynamic shared memory usage {required} exceeds device limit {available}")]
    ShmemTooLarge { required: usize, available: usize },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl GpuError {
    pub(crate) fn driver(call: &'static str, code: DriverCode) -> GpuError {
        GpuError::Driver { call, code }
    }

    /// CpuReCheck is the one kernel sentinel a session may recover from, by
    /// taking the CPU path when `cpu_fallback` is enabled.
    pub fn is_cpu_recheck(&self) -> bool {
        matches!(
            self,
            GpuError::Driver { code, .. }
                if StromCode::from_code(*code) == Some(StromCode::CpuReCheck)
        )
    }
}
