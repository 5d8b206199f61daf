use std::path::PathBuf;

/// Control-path errors. None of these ever cross into the real-time
/// `process` call; the adapter converts every failure into a bypass state
/// and hands the error back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Impulse response file missing, unreadable, or not 32-bit float PCM
    /// with 1 or 2 channels.
    #[error("failed to load impulse response {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// The kernel module refused the given parameters (e.g. allocation
    /// failure during FFT planning).
    #[error("kernel init refused (block={block_size}, channels={channels}, ir_len={ir_len})")]
    EngineInit {
        block_size: usize,
        channels: usize,
        ir_len: usize,
    },

    /// The native kernel library or one of its exported symbols could not
    /// be resolved. Fatal to plugin activation.
    #[error("kernel module load failed for {path:?}: {reason}")]
    ModuleLoad { path: PathBuf, reason: String },

    /// The kernel reported a non-zero status from its process call.
    #[error("kernel process returned status {status}")]
    Process { status: i32 },
}
