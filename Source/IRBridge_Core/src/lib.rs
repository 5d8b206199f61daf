pub mod adapter;
pub mod error;
pub mod ir;
pub mod kernel;

pub use adapter::{gain_db_from_param, gain_factor_from_param, ConvolutionEngineAdapter};
pub use error::EngineError;
pub use ir::ImpulseResponse;
pub use kernel::{ConvolutionKernel, KernelInstance, KernelModule};

/// Channel count of the engine contract. IR files may be mono (duplicated)
/// or stereo, but the kernel is always driven with two channels.
pub const ENGINE_CHANNELS: usize = 2;
