//! Dynamic loading of the real CUDA driver library.
//!
//! Uses `libloading` to load `libcuda.so.1` (or `nvcuda.dll` on Windows) and
//! implements the [`DeviceDriver`] trait over the raw driver API. Symbols are
//! resolved eagerly, preferring the `_v2` entry points with a fallback to the
//! legacy names.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::path::Path;
use std::sync::Arc;

use libloading::{Library, Symbol};
use tracing::{debug, info};

use crate::driver::{
    DevContext, DevFunction, DevHandle, DevModule, DevStream, DeviceDriver, DriverCode,
    DRIVER_SUCCESS,
};

const CU_STREAM_NON_BLOCKING: c_uint = 0x1;

type CUresult = c_int;
type CUdevice = c_int;
type CUcontext = *mut c_void;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;

type FnCuInit = unsafe extern "C" fn(flags: c_uint) -> CUresult;
type FnCuDeviceGetCount = unsafe extern "C" fn(count: *mut c_int) -> CUresult;
type FnCuDeviceGet = unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult;
type FnCuDeviceGetName =
    unsafe extern "C" fn(name: *mut c_char, len: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceGetAttribute =
    unsafe extern "C" fn(pi: *mut c_int, attrib: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceTotalMem = unsafe extern "C" fn(bytes: *mut usize, dev: CUdevice) -> CUresult;

type FnCuCtxCreate =
    unsafe extern "C" fn(pctx: *mut CUcontext, flags: c_uint, dev: CUdevice) -> CUresult;
type FnCuCtxDestroy = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CUresult;

type FnCuStreamCreate = unsafe extern "C" fn(phstream: *mut CUstream, flags: c_uint) -> CUresult;
type FnCuStreamDestroy = unsafe extern "C" fn(hstream: CUstream) -> CUresult;

type FnCuModuleLoad = unsafe extern "C" fn(module: *mut CUmodule, fname: *const c_char) -> CUresult;
type FnCuModuleUnload = unsafe extern "C" fn(hmod: CUmodule) -> CUresult;
type FnCuModuleGetFunction =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;

type FnCuFuncGetAttribute =
    unsafe extern "C" fn(pi: *mut c_int, attrib: c_int, hfunc: CUfunction) -> CUresult;
type FnCuOccupancyMaxActiveBlocks = unsafe extern "C" fn(
    num_blocks: *mut c_int,
    func: CUfunction,
    block_size: c_int,
    dynamic_smem_size: usize,
) -> CUresult;

type FnCuGetErrorName = unsafe extern "C" fn(code: CUresult, pstr: *mut *const c_char) -> CUresult;
type FnCuGetErrorString =
    unsafe extern "C" fn(code: CUresult, pstr: *mut *const c_char) -> CUresult;

/// Dynamically loaded CUDA driver with the function pointers this crate uses.
pub struct CudaDriver {
    _lib: Library,
    cu_init: FnCuInit,
    cu_device_get_count: FnCuDeviceGetCount,
    cu_device_get: FnCuDeviceGet,
    cu_device_get_name: FnCuDeviceGetName,
    cu_device_get_attribute: FnCuDeviceGetAttribute,
    cu_device_total_mem: FnCuDeviceTotalMem,
    cu_ctx_create: FnCuCtxCreate,
    cu_ctx_destroy: FnCuCtxDestroy,
    cu_ctx_set_current: FnCuCtxSetCurrent,
    cu_ctx_synchronize: FnCuCtxSynchronize,
    cu_stream_create: FnCuStreamCreate,
    cu_stream_destroy: FnCuStreamDestroy,
    cu_module_load: FnCuModuleLoad,
    cu_module_unload: FnCuModuleUnload,
    cu_module_get_function: FnCuModuleGetFunction,
    cu_func_get_attribute: FnCuFuncGetAttribute,
    cu_occupancy_max_active_blocks: FnCuOccupancyMaxActiveBlocks,
    cu_get_error_name: Option<FnCuGetErrorName>,
    cu_get_error_string: Option<FnCuGetErrorString>,
}

impl CudaDriver {
    /// Load the CUDA driver library and resolve all function pointers.
    pub fn load() -> Result<Arc<Self>, String> {
        let lib = Self::load_library()?;

        unsafe {
            let driver = Self {
                cu_init: Self::load_fn(&lib, "cuInit")?,
                cu_device_get_count: Self::load_fn(&lib, "cuDeviceGetCount")?,
                cu_device_get: Self::load_fn(&lib, "cuDeviceGet")?,
                cu_device_get_name: Self::load_fn(&lib, "cuDeviceGetName")?,
                cu_device_get_attribute: Self::load_fn(&lib, "cuDeviceGetAttribute")?,
                cu_device_total_mem: Self::load_fn(&lib, "cuDeviceTotalMem_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuDeviceTotalMem"))?,
                cu_ctx_create: Self::load_fn(&lib, "cuCtxCreate_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuCtxCreate"))?,
                cu_ctx_destroy: Self::load_fn(&lib, "cuCtxDestroy_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuCtxDestroy"))?,
                cu_ctx_set_current: Self::load_fn(&lib, "cuCtxSetCurrent")?,
                cu_ctx_synchronize: Self::load_fn(&lib, "cuCtxSynchronize")?,
                cu_stream_create: Self::load_fn(&lib, "cuStreamCreate")?,
                cu_stream_destroy: Self::load_fn(&lib, "cuStreamDestroy_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuStreamDestroy"))?,
                cu_module_load: Self::load_fn(&lib, "cuModuleLoad")?,
                cu_module_unload: Self::load_fn(&lib, "cuModuleUnload")?,
                cu_module_get_function: Self::load_fn(&lib, "cuModuleGetFunction")?,
                cu_func_get_attribute: Self::load_fn(&lib, "cuFuncGetAttribute")?,
                cu_occupancy_max_active_blocks: Self::load_fn(
                    &lib,
                    "cuOccupancyMaxActiveBlocksPerMultiprocessor",
                )?,
                cu_get_error_name: Self::load_fn_opt(&lib, "cuGetErrorName"),
                cu_get_error_string: Self::load_fn_opt(&lib, "cuGetErrorString"),
                _lib: lib,
            };

            info!("CUDA driver loaded successfully");
            Ok(Arc::new(driver))
        }
    }

    fn load_library() -> Result<Library, String> {
        #[cfg(target_os = "windows")]
        let lib_names = &["nvcuda.dll"];

        #[cfg(target_os = "linux")]
        let lib_names = &["libcuda.so.1", "libcuda.so"];

        #[cfg(target_os = "macos")]
        let lib_names = &["libcuda.dylib"];

        let mut last_err = String::new();
        for name in lib_names {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("loaded CUDA driver from: {}", name);
                    return Ok(lib);
                }
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    debug!("failed to load {}: {}", name, e);
                }
            }
        }

        Err(format!("failed to load CUDA driver library: {}", last_err))
    }

    unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, String> {
        let sym: Symbol<F> = unsafe { lib.get(name.as_bytes()) }
            .map_err(|e| format!("failed to load {}: {}", name, e))?;
        Ok(*sym)
    }

    unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
        unsafe { lib.get(name.as_bytes()) }.ok().map(|s: Symbol<F>| *s)
    }
}

fn check(res: CUresult) -> Result<(), DriverCode> {
    if res == DRIVER_SUCCESS {
        Ok(())
    } else {
        Err(res)
    }
}

impl DeviceDriver for CudaDriver {
    fn init(&self) -> Result<(), DriverCode> {
        check(unsafe { (self.cu_init)(0) })
    }

    fn device_count(&self) -> Result<i32, DriverCode> {
        let mut count: c_int = 0;
        check(unsafe { (self.cu_device_get_count)(&mut count) })?;
        Ok(count)
    }

    fn device_get(&self, ordinal: i32) -> Result<DevHandle, DriverCode> {
        let mut device: CUdevice = 0;
        check(unsafe { (self.cu_device_get)(&mut device, ordinal) })?;
        Ok(DevHandle(device))
    }

    fn device_name(&self, dev: DevHandle) -> Result<String, DriverCode> {
        let mut buf = [0u8; 256];
        check(unsafe {
            (self.cu_device_get_name)(buf.as_mut_ptr() as *mut c_char, buf.len() as c_int, dev.0)
        })?;
        let name = unsafe { CStr::from_ptr(buf.as_ptr() as *const c_char) };
        Ok(name.to_string_lossy().into_owned())
    }

    fn device_total_mem(&self, dev: DevHandle) -> Result<usize, DriverCode> {
        let mut bytes: usize = 0;
        check(unsafe { (self.cu_device_total_mem)(&mut bytes, dev.0) })?;
        Ok(bytes)
    }

    fn device_attribute(&self, attr: i32, dev: DevHandle) -> Result<i32, DriverCode> {
        let mut value: c_int = 0;
        check(unsafe { (self.cu_device_get_attribute)(&mut value, attr, dev.0) })?;
        Ok(value)
    }

    fn ctx_create(&self, dev: DevHandle) -> Result<DevContext, DriverCode> {
        let mut ctx: CUcontext = std::ptr::null_mut();
        check(unsafe { (self.cu_ctx_create)(&mut ctx, 0, dev.0) })?;
        Ok(DevContext(ctx as u64))
    }

    fn ctx_destroy(&self, ctx: DevContext) -> Result<(), DriverCode> {
        check(unsafe { (self.cu_ctx_destroy)(ctx.0 as CUcontext) })
    }

    fn ctx_set_current(&self, ctx: Option<DevContext>) -> Result<(), DriverCode> {
        let raw = ctx.map_or(std::ptr::null_mut(), |c| c.0 as CUcontext);
        check(unsafe { (self.cu_ctx_set_current)(raw) })
    }

    fn ctx_synchronize(&self) -> Result<(), DriverCode> {
        check(unsafe { (self.cu_ctx_synchronize)() })
    }

    fn stream_create_non_blocking(&self) -> Result<DevStream, DriverCode> {
        let mut stream: CUstream = std::ptr::null_mut();
        check(unsafe { (self.cu_stream_create)(&mut stream, CU_STREAM_NON_BLOCKING) })?;
        Ok(DevStream(stream as u64))
    }

    fn stream_destroy(&self, stream: DevStream) -> Result<(), DriverCode> {
        check(unsafe { (self.cu_stream_destroy)(stream.0 as CUstream) })
    }

    fn module_load(&self, path: &Path) -> Result<DevModule, DriverCode> {
        let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| 1)?;
        let mut module: CUmodule = std::ptr::null_mut();
        check(unsafe { (self.cu_module_load)(&mut module, c_path.as_ptr()) })?;
        Ok(DevModule(module as u64))
    }

    fn module_unload(&self, module: DevModule) -> Result<(), DriverCode> {
        check(unsafe { (self.cu_module_unload)(module.0 as CUmodule) })
    }

    fn module_get_function(
        &self,
        module: DevModule,
        name: &str,
    ) -> Result<DevFunction, DriverCode> {
        let c_name = CString::new(name).map_err(|_| 1)?;
        let mut func: CUfunction = std::ptr::null_mut();
        check(unsafe {
            (self.cu_module_get_function)(&mut func, module.0 as CUmodule, c_name.as_ptr())
        })?;
        Ok(DevFunction(func as u64))
    }

    fn func_attribute(&self, attr: i32, func: DevFunction) -> Result<i32, DriverCode> {
        let mut value: c_int = 0;
        check(unsafe { (self.cu_func_get_attribute)(&mut value, attr, func.0 as CUfunction) })?;
        Ok(value)
    }

    fn occupancy_max_active_blocks(
        &self,
        func: DevFunction,
        block_size: i32,
        dynamic_smem: usize,
    ) -> Result<i32, DriverCode> {
        let mut num_blocks: c_int = 0;
        check(unsafe {
            (self.cu_occupancy_max_active_blocks)(
                &mut num_blocks,
                func.0 as CUfunction,
                block_size,
                dynamic_smem,
            )
        })?;
        Ok(num_blocks)
    }

    fn error_name(&self, code: DriverCode) -> Option<String> {
        let func = self.cu_get_error_name?;
        let mut ptr: *const c_char = std::ptr::null();
        if unsafe { func(code, &mut ptr) } != DRIVER_SUCCESS || ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    fn error_string(&self, code: DriverCode) -> Option<String> {
        let func = self.cu_get_error_string?;
        let mut ptr: *const c_char = std::ptr::null();
        if unsafe { func(code, &mut ptr) } != DRIVER_SUCCESS || ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}
