//! Content-addressed compile cache.
//!
//! A compiled procedure lives at
//! `<base>/<tempdir>/<prefix>_plgpu_<funcid>_<digest>_cc<compcap>`; when the
//! binary already exists it is reused without touching the toolchain. The
//! build step writes the flat source to a sibling `.cu` file and runs the
//! external compiler out of process, capturing its output.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use pgaccel_core::catalog::ProcId;
use pgaccel_core::config::AccelConfig;

use crate::compose::FlatSource;
use crate::error::PlGpuError;

pub struct CacheDriver {
    config: Arc<AccelConfig>,
    /// Digest -> binary path memo for entries this process already proved
    /// present on disk.
    built: DashMap<String, PathBuf>,
}

impl CacheDriver {
    pub fn new(config: Arc<AccelConfig>) -> CacheDriver {
        CacheDriver {
            config,
            built: DashMap::new(),
        }
    }

    pub fn cache_path(&self, func: ProcId, digest: &str, compute_capability: i32) -> PathBuf {
        Path::new(&self.config.base_dir)
            .join(&self.config.temp_dir)
            .join(format!(
                "{}_plgpu_{}_{}_cc{}",
                self.config.temp_file_prefix, func.0, digest, compute_capability
            ))
    }

    /// Return the path of the compiled binary for `flat`, building it only
    /// when no cached copy exists.
    pub fn ensure_binary(
        &self,
        func: ProcId,
        flat: &FlatSource,
        compute_capability: i32,
    ) -> Result<PathBuf, PlGpuError> {
        if let Some(path) = self.built.get(&flat.digest) {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        let binary = self.cache_path(func, &flat.digest, compute_capability);
        if !binary.exists() {
            self.build(&binary, &flat.text, compute_capability)?;
        }
        self.built.insert(flat.digest.clone(), binary.clone());
        Ok(binary)
    }

    fn build(
        &self,
        binary: &Path,
        source: &str,
        compute_capability: i32,
    ) -> Result<(), PlGpuError> {
        if let Some(parent) = binary.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PlGpuError::Ipc {
                op: "mkdir",
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let cu_path = binary.with_extension("cu");
        write_source(&cu_path, source)?;

        let output = Command::new(&self.config.compiler_path)
            .arg(format!("--gpu-architecture=sm_{compute_capability}"))
            .arg("--default-stream=per-thread")
            .arg("-I")
            .arg(&self.config.include_dir)
            .arg("-O2")
            .arg("-std=c++11")
            .arg("-o")
            .arg(binary)
            .arg(&cu_path)
            .output()
            .map_err(|e| PlGpuError::CompileFailure {
                log: format!(
                    "could not kick the device compiler '{}': {e}",
                    self.config.compiler_path
                ),
            })?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(PlGpuError::CompileFailure { log });
        }
        if !log.trim().is_empty() {
            info!("procedure compilation log:\n{log}");
        }
        Ok(())
    }
}

fn write_source(cu_path: &Path, source: &str) -> Result<(), PlGpuError> {
    use std::io::Write;

    // Exclusive create; a concurrent build of the same digest already wrote
    // identical bytes, so an existing file is fine as-is.
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(cu_path)
    {
        Ok(mut file) => file.write_all(source.as_bytes()).map_err(|e| PlGpuError::Ipc {
            op: "write",
            path: cu_path.display().to_string(),
            source: e,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(PlGpuError::Ipc {
            op: "open",
            path: cu_path.display().to_string(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_layout() {
        let mut config = AccelConfig::default();
        config.base_dir = "/var/lib/db/base".to_string();
        let cache = CacheDriver::new(Arc::new(config));
        let path = cache.cache_path(ProcId(4711), "deadbeef", 601);
        assert_eq!(
            path,
            PathBuf::from("/var/lib/db/base/pgsql_tmp/pgsql_tmp_plgpu_4711_deadbeef_cc601")
        );
    }

    #[test]
    fn missing_compiler_reports_a_compile_failure() {
        let mut config = AccelConfig::default();
        config.base_dir = std::env::temp_dir()
            .join(format!("plgpu_cc_{}", rand::random::<u32>()))
            .display()
            .to_string();
        config.compiler_path = "/nonexistent/nvcc".to_string();
        let cache = CacheDriver::new(Arc::new(config));

        let flat = FlatSource {
            text: "int main() { return 0; }\n".to_string(),
            digest: "0123abcd".to_string(),
        };
        let err = cache
            .ensure_binary(ProcId(1), &flat, 601)
            .expect_err("must fail");
        assert!(matches!(err, PlGpuError::CompileFailure { .. }));
    }
}
