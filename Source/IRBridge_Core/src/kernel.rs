//! FFI boundary to the native partitioned-convolution kernel.
//!
//! The kernel ships as a separate dynamic library next to the plugin module,
//! named after it with a `lib` suffix (`<pluginbasename>lib.dll` on Windows).
//! Its algorithm is opaque; this module only speaks the three-call contract
//! (init / process / exit) and keeps the library alive for as long as any
//! engine handle built from it exists.

use libloading::Library;
use log::warn;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::EngineError;
use crate::ir::ImpulseResponse;

type InitFn =
    unsafe extern "C" fn(block_size: u32, channels: u32, ir_len: u32, ir_data: *const *const f32)
        -> *mut c_void;
type ProcessFn = unsafe extern "C" fn(
    handle: *mut c_void,
    block_size: u32,
    in_channels: u32,
    out_channels: u32,
    inputs: *const *const f32,
    outputs: *const *mut f32,
) -> i32;
type ExitFn = unsafe extern "C" fn(handle: *mut c_void) -> i32;

/// Factory seam for the adapter: anything that can build a ready-to-process
/// engine from an impulse response at a given block size.
pub trait ConvolutionKernel: Send + Sync {
    fn instantiate(
        &self,
        block_size: usize,
        channels: usize,
        ir: &ImpulseResponse,
    ) -> Result<Box<dyn KernelInstance>, EngineError>;
}

/// One live engine. Owned exclusively by the adapter; dropped before a
/// replacement is requested.
pub trait KernelInstance: Send {
    /// Run one block. Inputs and outputs are planar, one slice per channel,
    /// all of the block size the instance was built for. Must not allocate.
    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<(), EngineError>;
}

/// Derive the kernel library path from the plugin's own module path:
/// same directory, file stem plus `lib`, platform dylib extension.
pub fn kernel_path_for(plugin_module: &Path) -> PathBuf {
    let stem = plugin_module
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    plugin_module.with_file_name(format!("{}lib.{}", stem, std::env::consts::DLL_EXTENSION))
}

/// Resolve a symbol under any of several equivalent spellings. The original
/// toolchain exported both plain and underscore-prefixed names depending on
/// calling convention, so both must be accepted.
fn resolve_either<T: Copy>(lib: &Library, names: &[&[u8]]) -> Result<T, String> {
    for name in names {
        // Symbol<T> borrows the library; copy the raw fn pointer out.
        if let Ok(symbol) = unsafe { lib.get::<T>(name) } {
            return Ok(*symbol);
        }
    }
    let spellings: Vec<String> = names
        .iter()
        .map(|n| String::from_utf8_lossy(&n[..n.len() - 1]).into_owned())
        .collect();
    Err(format!("none of {:?} resolved", spellings))
}

/// The loaded native kernel library with its three entry points resolved.
pub struct KernelModule {
    _lib: Arc<Library>,
    path: PathBuf,
    init: InitFn,
    process: ProcessFn,
    exit: ExitFn,
}

impl KernelModule {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let module_err = |reason: String| EngineError::ModuleLoad {
            path: path.to_path_buf(),
            reason,
        };

        let lib = unsafe { Library::new(path) }.map_err(|e| module_err(e.to_string()))?;

        let init: InitFn =
            resolve_either(&lib, &[b"conv_init\0", b"_conv_init\0"]).map_err(module_err)?;
        let process: ProcessFn =
            resolve_either(&lib, &[b"conv_process\0", b"_conv_process\0"]).map_err(module_err)?;
        let exit: ExitFn =
            resolve_either(&lib, &[b"conv_exit\0", b"_conv_exit\0"]).map_err(module_err)?;

        Ok(Self {
            _lib: Arc::new(lib),
            path: path.to_path_buf(),
            init,
            process,
            exit,
        })
    }

    /// Load the kernel that belongs to the given plugin module.
    pub fn load_for_plugin(plugin_module: &Path) -> Result<Self, EngineError> {
        Self::load(&kernel_path_for(plugin_module))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConvolutionKernel for KernelModule {
    fn instantiate(
        &self,
        block_size: usize,
        channels: usize,
        ir: &ImpulseResponse,
    ) -> Result<Box<dyn KernelInstance>, EngineError> {
        // Per-channel sample pointers, valid for the duration of the call.
        // The kernel copies what it needs during init and retains nothing.
        let ir_ptrs: Vec<*const f32> = ir
            .channels
            .iter()
            .take(channels)
            .map(|ch| ch.as_ptr())
            .collect();

        let handle = unsafe {
            (self.init)(
                block_size as u32,
                channels as u32,
                ir.frames as u32,
                ir_ptrs.as_ptr(),
            )
        };

        if handle.is_null() {
            return Err(EngineError::EngineInit {
                block_size,
                channels,
                ir_len: ir.frames,
            });
        }

        Ok(Box::new(KernelEngine {
            handle,
            process: self.process,
            exit: self.exit,
            _lib: Arc::clone(&self._lib),
        }))
    }
}

struct KernelEngine {
    handle: *mut c_void,
    process: ProcessFn,
    exit: ExitFn,
    // Keeps the library mapped while the handle is live.
    _lib: Arc<Library>,
}

// The opaque handle is only ever touched by one thread at a time: the
// adapter serializes every process/destroy access through its slot lock.
unsafe impl Send for KernelEngine {}

impl KernelInstance for KernelEngine {
    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<(), EngineError> {
        debug_assert!(!inputs.is_empty() && inputs.len() == outputs.len());
        let block_size = inputs[0].len();

        // Fixed-size pointer tables on the stack; the real-time path must
        // not allocate.
        let mut in_ptrs = [std::ptr::null::<f32>(); 2];
        let mut out_ptrs = [std::ptr::null_mut::<f32>(); 2];
        for (slot, ch) in in_ptrs.iter_mut().zip(inputs.iter()) {
            *slot = ch.as_ptr();
        }
        for (slot, ch) in out_ptrs.iter_mut().zip(outputs.iter_mut()) {
            *slot = ch.as_mut_ptr();
        }

        let status = unsafe {
            (self.process)(
                self.handle,
                block_size as u32,
                inputs.len() as u32,
                outputs.len() as u32,
                in_ptrs.as_ptr(),
                out_ptrs.as_ptr(),
            )
        };

        if status != 0 {
            return Err(EngineError::Process { status });
        }
        Ok(())
    }
}

impl Drop for KernelEngine {
    fn drop(&mut self) {
        // Teardown failures are swallowed; this commonly runs on shutdown
        // paths where nothing can recover anyway.
        let status = unsafe { (self.exit)(self.handle) };
        if status != 0 {
            warn!("kernel exit returned status {}", status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_path_follows_lib_suffix_convention() {
        let ext = std::env::consts::DLL_EXTENSION;
        let plugin = PathBuf::from("/opt/plugins/irbridge.vst");
        assert_eq!(
            kernel_path_for(&plugin),
            PathBuf::from(format!("/opt/plugins/irbridgelib.{}", ext))
        );
    }

    #[test]
    fn missing_library_is_module_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_such_kernel.dll");
        match KernelModule::load(&path) {
            Err(EngineError::ModuleLoad { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected ModuleLoad error, got {:?}", other.err()),
        }
    }
}
