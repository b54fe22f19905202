//! Procedure validator and call handler.
//!
//! Wires the pipeline together: expand the annotated source, compose the
//! flat translation unit, make sure the binary exists in the compile cache,
//! marshal arguments into shared memory, supervise the child and materialize
//! whatever it wrote back. Segment cleanup is RAII-backed, so both the
//! normal return and every error path leave the shared-memory namespace
//! clean.

use std::sync::Arc;

use tracing::{info, warn};

use pgaccel_core::arena::Arena;
use pgaccel_core::catalog::{ProcCatalog, ProcId, ProcRecord};
use pgaccel_core::config::AccelConfig;
use pgaccel_core::interrupt::check_for_interrupts;
use pgaccel_core::types::Value;
use pgaccel_core::CoreError;

use crate::compile::CacheDriver;
use crate::compose::{self, FlatSource};
use crate::error::PlGpuError;
use crate::result::{materialize_scalar, materialize_set, ResultRow};
use crate::shmem::{self, GstoreExporter};
use crate::source::{self, ExpandedSource};
use crate::spawn::{self, ChildStatus};

/// Outcome of validating a procedure at creation time.
#[derive(Debug)]
pub struct ValidationReport {
    /// Compilation was deferred to run time because the source pulls in
    /// helper inclusions that may change the code per call.
    pub deferred: bool,
    /// Diagnostics that were reported as warnings rather than errors.
    pub warnings: Option<String>,
}

pub struct ProcedureHandler {
    config: Arc<AccelConfig>,
    catalog: Arc<dyn ProcCatalog>,
    cache: CacheDriver,
    compute_capability: i32,
    gstore: Option<Arc<dyn GstoreExporter>>,
}

impl ProcedureHandler {
    pub fn new(
        config: Arc<AccelConfig>,
        catalog: Arc<dyn ProcCatalog>,
        compute_capability: i32,
    ) -> ProcedureHandler {
        ProcedureHandler {
            cache: CacheDriver::new(config.clone()),
            config,
            catalog,
            compute_capability,
            gstore: None,
        }
    }

    pub fn with_gstore_exporter(mut self, exporter: Arc<dyn GstoreExporter>) -> ProcedureHandler {
        self.gstore = Some(exporter);
        self
    }

    fn proc_record(&self, func: ProcId) -> Result<ProcRecord, PlGpuError> {
        self.catalog
            .get(func)
            .ok_or_else(|| PlGpuError::Core(CoreError::Catalog(format!(
                "cache lookup failed for function {}",
                func.0
            ))))
    }

    /// Validate a procedure at creation time.
    ///
    /// Bodies without inclusions are expanded, composed and compiled right
    /// away; any diagnostic is an error. Bodies with inclusions can change
    /// per call, so their diagnostics (probed with all-null arguments)
    /// only warn, and compilation is deferred to the first call.
    pub fn validate(&self, func: ProcId) -> Result<ValidationReport, PlGpuError> {
        let proc = self.proc_record(func)?;
        let null_args = vec![Value::Null; proc.arg_types.len()];
        let expanded = source::expand(&proc, self.catalog.as_ref(), Some(&null_args));

        if expanded.include_count > 0 {
            let warnings = if expanded.diagnostics.is_empty() {
                None
            } else {
                let text = expanded.diagnostics.to_string();
                warn!("kernel source construction reported problems:{text}");
                Some(text)
            };
            info!(
                "procedure \"{}\" is not built at creation time because an inclusion may change the code at run time",
                proc.name
            );
            return Ok(ValidationReport {
                deferred: true,
                warnings,
            });
        }

        let expanded = expanded.into_result()?;
        let flat = compose::make_flat_source(&proc, &expanded);
        self.ensure_binary(&proc, &flat)?;
        Ok(ValidationReport {
            deferred: false,
            warnings: None,
        })
    }

    /// Invoke a scalar procedure. The result value is materialized into
    /// `results`, which outlives the returned value as long as the caller
    /// needs it.
    pub fn call_scalar(
        &self,
        func: ProcId,
        args: &[Value],
        results: &Arena,
    ) -> Result<Value, PlGpuError> {
        check_for_interrupts().map_err(PlGpuError::Core)?;
        let proc = self.proc_record(func)?;
        if proc.arg_types.len() != args.len() {
            return Err(PlGpuError::Core(CoreError::Catalog(format!(
                "function {} called with {} arguments, expects {}",
                proc.name,
                args.len(),
                proc.arg_types.len()
            ))));
        }

        let expanded: ExpandedSource =
            source::expand(&proc, self.catalog.as_ref(), Some(args)).into_result()?;
        let flat = compose::make_flat_source(&proc, &expanded);
        let binary = self.ensure_binary(&proc, &flat)?;

        let marshalled =
            shmem::setup_arguments(proc.id.0, &proc.arg_types, args, self.gstore.as_deref())?;
        let result_segment = shmem::setup_result_buffer(proc.id.0, proc.ret_type)?;

        let status = spawn::exec_procedure(
            &binary,
            marshalled.segment.as_ref().map(|s| s.name()),
            Some(result_segment.name()),
            &marshalled.tokens,
        )?;

        match status {
            ChildStatus::Null => Ok(Value::Null),
            ChildStatus::Value => materialize_scalar(&result_segment, proc.ret_type, results),
        }
        // marshalled.segment and result_segment drop here, unlinking both
        // names on success and error paths alike
    }

    /// Invoke a set-returning procedure: the scalar result is an array
    /// carrier that unrolls into rows.
    pub fn call_set(
        &self,
        func: ProcId,
        args: &[Value],
        results: &Arena,
    ) -> Result<Vec<ResultRow>, PlGpuError> {
        let proc = self.proc_record(func)?;
        let value = self.call_scalar(func, args, results)?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        materialize_set(&value, proc.ret_type)
    }

    fn ensure_binary(
        &self,
        proc: &ProcRecord,
        flat: &FlatSource,
    ) -> Result<std::path::PathBuf, PlGpuError> {
        let binary = self
            .cache
            .ensure_binary(proc.id, flat, self.compute_capability)?;
        if self.config.debug_kernel_source {
            info!(
                "procedure \"{}\" kernel source: {}.cu",
                proc.name,
                binary.display()
            );
        }
        Ok(binary)
    }
}
