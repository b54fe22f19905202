//! Argument/result exchange through POSIX shared memory.
//!
//! Each invocation owns uniquely named segments sized exactly for the
//! marshalled payload; they are unlinked on every path, success or error,
//! when the owning handles drop.

use std::ffi::CString;
use std::io;

use tracing::warn;

use pgaccel_common::platform::{max_align, BLCKSZ};
use pgaccel_core::types::{varlena, HostType, Value};
use pgaccel_core::CoreError;

use crate::error::PlGpuError;

/// Resolver turning a gstore table identifier into the device IPC handle
/// bytes passed to the child. Provided by the data-store layer.
pub trait GstoreExporter: Send + Sync {
    fn export_ipc_handle(&self, ftable: u32) -> Result<Vec<u8>, CoreError>;
}

/// A named POSIX shared-memory segment, created exclusively and unlinked on
/// drop.
pub struct ShmSegment {
    name: String,
    fd: libc::c_int,
    size: usize,
}

impl ShmSegment {
    /// Create `/.plgpu_<funcid>_<kind>.<rand>.dat`, retrying on name
    /// collisions, and size it to `size` bytes.
    pub fn create(func_id: u32, kind: &str, size: usize) -> Result<ShmSegment, PlGpuError> {
        loop {
            let name = format!("/.plgpu_{}_{}.{}.dat", func_id, kind, rand::random::<u32>());
            let c_name = cstring(&name)?;
            let fd = unsafe {
                libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    0o600,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EEXIST) {
                    continue;
                }
                return Err(PlGpuError::Ipc {
                    op: "shm_open",
                    path: name,
                    source: err,
                });
            }
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(PlGpuError::Ipc {
                    op: "ftruncate",
                    path: name,
                    source: err,
                });
            }
            return Ok(ShmSegment { name, fd, size });
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Map the segment writable at its creation size.
    pub fn map_rw(&self) -> Result<ShmMapping, PlGpuError> {
        self.map(self.size, libc::PROT_READ | libc::PROT_WRITE)
    }

    /// Map the segment read-only at its *current* size (the child may have
    /// grown it while producing the result).
    pub fn map_ro(&self) -> Result<ShmMapping, PlGpuError> {
        let mut stbuf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut stbuf) } != 0 {
            return Err(PlGpuError::Ipc {
                op: "fstat",
                path: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        self.map(stbuf.st_size as usize, libc::PROT_READ)
    }

    fn map(&self, len: usize, prot: libc::c_int) -> Result<ShmMapping, PlGpuError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len.max(1),
                prot,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PlGpuError::Ipc {
                op: "mmap",
                path: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(ShmMapping {
            ptr: ptr as *mut u8,
            len,
        })
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
        if let Ok(c_name) = cstring(&self.name) {
            if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
                warn!(
                    "failed on shm_unlink('{}'): {}",
                    self.name,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

pub struct ShmMapping {
    ptr: *mut u8,
    len: usize,
}

impl ShmMapping {
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len.max(1)) } != 0 {
            warn!("failed on munmap: {}", io::Error::last_os_error());
        }
    }
}

fn cstring(name: &str) -> Result<CString, PlGpuError> {
    CString::new(name).map_err(|_| PlGpuError::Ipc {
        op: "shm_open",
        path: name.to_string(),
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })
}

/// Marshalled invocation arguments: one token per argument plus the segment
/// holding the by-reference payloads, when any exist.
pub struct MarshalledArgs {
    pub tokens: Vec<String>,
    pub segment: Option<ShmSegment>,
}

/// Encode the call arguments. By-value datums travel as `v:<hex>` tokens,
/// by-reference ones as `r:<hex>` offsets into the argument segment, gstores
/// as `g:<hex>` IPC handles, nulls as `__null__`.
pub fn setup_arguments(
    func_id: u32,
    arg_types: &[HostType],
    args: &[Value],
    gstore: Option<&dyn GstoreExporter>,
) -> Result<MarshalledArgs, PlGpuError> {
    debug_assert_eq!(arg_types.len(), args.len());

    let mut tokens = Vec::with_capacity(args.len());
    let mut offsets = vec![0usize; args.len()];
    let mut required = 0usize;

    for (i, (&ty, value)) in arg_types.iter().zip(args).enumerate() {
        offsets[i] = required;
        if value.is_null() {
            tokens.push("__null__".to_string());
            continue;
        }
        match (ty, value) {
            (HostType::GStore, Value::GStore(ftable)) => {
                let exporter = gstore.ok_or_else(|| {
                    PlGpuError::Core(CoreError::Catalog(
                        "no gstore exporter is configured".into(),
                    ))
                })?;
                let handle = exporter.export_ipc_handle(*ftable)?;
                let mut token = String::with_capacity(2 + handle.len() * 2);
                token.push_str("g:");
                for byte in handle {
                    token.push_str(&format!("{byte:02x}"));
                }
                tokens.push(token);
            }
            _ if ty.byval() => {
                let word = value.as_datum_word().ok_or_else(|| {
                    PlGpuError::Core(CoreError::Corrupt(format!(
                        "argument {} does not match type {}",
                        i + 1,
                        ty.name()
                    )))
                })?;
                tokens.push(format!("v:{word:x}"));
            }
            _ => {
                let bytes = value.as_ref_bytes().ok_or_else(|| {
                    PlGpuError::Core(CoreError::Corrupt(format!(
                        "argument {} does not match type {}",
                        i + 1,
                        ty.name()
                    )))
                })?;
                let copied = if ty.len() > 0 {
                    ty.len() as usize
                } else {
                    // always a fully de-toasted carrier
                    varlena::total_size(bytes).map_err(PlGpuError::Core)?
                };
                tokens.push(format!("r:{required:x}"));
                required += max_align(copied);
            }
        }
    }

    if required == 0 {
        return Ok(MarshalledArgs {
            tokens,
            segment: None,
        });
    }

    let segment = ShmSegment::create(func_id, "argbuf", required)?;
    {
        let mut mapping = segment.map_rw()?;
        let buffer = mapping.as_mut_slice();
        for (i, (&ty, value)) in arg_types.iter().zip(args).enumerate() {
            if value.is_null() || ty.byval() {
                continue;
            }
            if let Some(bytes) = value.as_ref_bytes() {
                let copied = if ty.len() > 0 {
                    ty.len() as usize
                } else {
                    varlena::total_size(bytes).map_err(PlGpuError::Core)?
                };
                buffer[offsets[i]..offsets[i] + copied].copy_from_slice(&bytes[..copied]);
            }
        }
    }

    Ok(MarshalledArgs {
        tokens,
        segment: Some(segment),
    })
}

/// Create the result segment: at least one block, and at least the result
/// type's fixed width. The child may grow it for larger variable-length
/// results.
pub fn setup_result_buffer(func_id: u32, ret_type: HostType) -> Result<ShmSegment, PlGpuError> {
    let typlen = ret_type.len();
    let required = BLCKSZ.max(if typlen > 0 { typlen as usize } else { 0 });
    ShmSegment::create(func_id, "result", required)
}
