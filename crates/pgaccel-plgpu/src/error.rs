use pgaccel_core::CoreError;

use crate::source::Diagnostics;

#[derive(Debug, thiserror::Error)]
pub enum PlGpuError {
    /// Accumulated preprocessing diagnostics; one composite message so a
    /// single parse surfaces as many problems as possible.
    #[error("failed on kernel source construction:{0}")]
    Source(Diagnostics),

    #[error("procedure compilation failed.\n{log}")]
    CompileFailure { log: String },

    #[error("failed on {op}('{path}'): {source}")]
    Ipc {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed on fork(2): {0}")]
    ChildSpawnFailure(std::io::Error),

    #[error("failed on waitpid(2): {0}")]
    ChildWaitFailure(std::io::Error),

    #[error("GPU script was terminated abnormally (code: {0})")]
    ScriptAbnormalExit(i32),

    #[error("GPU script was terminated by signal: {0}")]
    ScriptSignalled(i32),

    #[error(transparent)]
    Core(#[from] CoreError),
}
