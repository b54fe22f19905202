//! Translation of internal sentinel codes and driver status codes into
//! stable text. Must stay callable during error unwind: no panics, and the
//! sentinel path never allocates.

use std::borrow::Cow;

use crate::driver::{DeviceDriver, DriverCode};

/// Internal sentinel codes raised by device kernels. Kept in a reserved band
/// well above any driver status code.
pub const STROM_ERROR_BASE: DriverCode = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum StromCode {
    CpuReCheck = STROM_ERROR_BASE + 1,
    CudaInternal = STROM_ERROR_BASE + 2,
    OutOfMemory = STROM_ERROR_BASE + 3,
    OutOfSharedMemory = STROM_ERROR_BASE + 4,
    DataStoreCorruption = STROM_ERROR_BASE + 5,
    DataStoreNoSpace = STROM_ERROR_BASE + 6,
    DataStoreOutOfRange = STROM_ERROR_BASE + 7,
    SanityCheckViolation = STROM_ERROR_BASE + 8,
}

impl StromCode {
    pub fn from_code(code: DriverCode) -> Option<StromCode> {
        Some(match code.wrapping_sub(STROM_ERROR_BASE) {
            1 => StromCode::CpuReCheck,
            2 => StromCode::CudaInternal,
            3 => StromCode::OutOfMemory,
            4 => StromCode::OutOfSharedMemory,
            5 => StromCode::DataStoreCorruption,
            6 => StromCode::DataStoreNoSpace,
            7 => StromCode::DataStoreOutOfRange,
            8 => StromCode::SanityCheckViolation,
            _ => return None,
        })
    }

    pub const fn text(self) -> &'static str {
        match self {
            StromCode::CpuReCheck => "CPU ReCheck",
            StromCode::CudaInternal => "CUDA Internal Error",
            StromCode::OutOfMemory => "Out of memory",
            StromCode::OutOfSharedMemory => "Out of shared memory",
            StromCode::DataStoreCorruption => "Data store corruption",
            StromCode::DataStoreNoSpace => "Data store no space",
            StromCode::DataStoreOutOfRange => "Data store out of range",
            StromCode::SanityCheckViolation => "Sanity check violation",
        }
    }
}

/// Built-in name/description table for common driver status codes, used when
/// no driver is at hand (or the driver does not know the code).
pub(crate) fn builtin_driver_error(code: DriverCode) -> Option<(&'static str, &'static str)> {
    Some(match code {
        0 => ("CUDA_SUCCESS", "no error"),
        1 => ("CUDA_ERROR_INVALID_VALUE", "invalid argument"),
        2 => ("CUDA_ERROR_OUT_OF_MEMORY", "out of memory"),
        3 => ("CUDA_ERROR_NOT_INITIALIZED", "initialization error"),
        4 => ("CUDA_ERROR_DEINITIALIZED", "driver shutting down"),
        100 => ("CUDA_ERROR_NO_DEVICE", "no CUDA-capable device is detected"),
        101 => ("CUDA_ERROR_INVALID_DEVICE", "invalid device ordinal"),
        200 => ("CUDA_ERROR_INVALID_IMAGE", "device kernel image is invalid"),
        201 => ("CUDA_ERROR_INVALID_CONTEXT", "invalid device context"),
        209 => (
            "CUDA_ERROR_NO_BINARY_FOR_GPU",
            "no kernel image is available for execution on the device",
        ),
        304 => ("CUDA_ERROR_OPERATING_SYSTEM", "OS call failed"),
        400 => ("CUDA_ERROR_INVALID_HANDLE", "invalid resource handle"),
        500 => ("CUDA_ERROR_NOT_FOUND", "named symbol not found"),
        600 => ("CUDA_ERROR_NOT_READY", "device not ready"),
        700 => ("CUDA_ERROR_ILLEGAL_ADDRESS", "an illegal memory access was encountered"),
        701 => (
            "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
            "too many resources requested for launch",
        ),
        702 => ("CUDA_ERROR_LAUNCH_TIMEOUT", "the launch timed out and was terminated"),
        719 => ("CUDA_ERROR_LAUNCH_FAILED", "unspecified launch failure"),
        801 => ("CUDA_ERROR_NOT_SUPPORTED", "operation not supported"),
        _ => return None,
    })
}

/// Render a status code with the built-in tables only.
pub fn error_text(code: DriverCode) -> Cow<'static, str> {
    if let Some(sentinel) = StromCode::from_code(code) {
        return Cow::Borrowed(sentinel.text());
    }
    match builtin_driver_error(code) {
        Some((name, desc)) => Cow::Owned(format!("{name} - {desc}")),
        None => Cow::Owned(format!("{code} - unknown")),
    }
}

/// Render a status code, preferring the driver's own symbolic name and
/// description over the built-in table.
pub fn error_text_with(driver: &dyn DeviceDriver, code: DriverCode) -> Cow<'static, str> {
    if let Some(sentinel) = StromCode::from_code(code) {
        return Cow::Borrowed(sentinel.text());
    }
    if let (Some(name), Some(desc)) = (driver.error_name(code), driver.error_string(code)) {
        return Cow::Owned(format!("{name} - {desc}"));
    }
    error_text(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_codes_render_fixed_strings() {
        assert_eq!(error_text(StromCode::CpuReCheck as i32), "CPU ReCheck");
        assert_eq!(error_text(StromCode::OutOfMemory as i32), "Out of memory");
        assert_eq!(
            error_text(StromCode::DataStoreCorruption as i32),
            "Data store corruption"
        );
    }

    #[test]
    fn driver_codes_render_name_and_description() {
        assert_eq!(error_text(2), "CUDA_ERROR_OUT_OF_MEMORY - out of memory");
    }

    #[test]
    fn unknown_codes_render_numeric() {
        assert_eq!(error_text(31337), "31337 - unknown");
    }
}
