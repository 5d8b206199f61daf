#![allow(non_snake_case)] // Crate name matches project branding
use irbridge_core::{
    gain_db_from_param, ConvolutionEngineAdapter, EngineError, KernelModule, ENGINE_CHANNELS,
};
use log::info;
use nih_plug::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod loader;
pub mod logger;

pub struct IRBridgePlugin {
    params: Arc<IRBridgeParams>,

    pub logger: Arc<logger::InstanceLogger>,

    // Built on first initialize(); None means the kernel module could not
    // be resolved and the plugin refused activation.
    adapter: Option<Arc<ConvolutionEngineAdapter>>,
    loader: Option<loader::Loader>,

    // Scratch buffers for planar adaptation
    scratch_input: Vec<Vec<f32>>,
    scratch_output: Vec<Vec<f32>>,

    init_load_triggered: bool,
    last_ir_path: String,
}

#[derive(Serialize, Deserialize)]
pub struct SharedPluginState {
    /// The "program name": path of the active impulse response file.
    #[serde(default)]
    pub ir_path: String,
}

impl Default for SharedPluginState {
    fn default() -> Self {
        Self {
            ir_path: String::new(),
        }
    }
}

#[derive(Params)]
pub struct IRBridgeParams {
    #[persist = "shared_v1"]
    pub shared: Arc<RwLock<SharedPluginState>>,

    #[id = "enabled"]
    pub enabled: BoolParam,

    #[id = "gain"]
    pub gain: FloatParam,
}

impl Default for IRBridgePlugin {
    fn default() -> Self {
        let instance_id = logger::generate_instance_id();
        let logger = logger::InstanceLogger::new(&instance_id);
        logger.info("Plugin", "Creating new IRBridgePlugin instance...");

        Self {
            params: Arc::new(IRBridgeParams::default()),
            logger,
            adapter: None,
            loader: None,
            scratch_input: Vec::new(),
            scratch_output: Vec::new(),
            init_load_triggered: false,
            last_ir_path: String::new(),
        }
    }
}

impl Default for IRBridgeParams {
    fn default() -> Self {
        Self {
            enabled: BoolParam::new("Enabled", true),

            // Host surface is 0..1; displayed on the -50..0 dB scale the
            // engine's post-gain uses.
            gain: FloatParam::new("Gain", 1.0, FloatRange::Linear { min: 0.0, max: 1.0 })
                .with_unit(" dB")
                .with_value_to_string(Arc::new(|value: f32| {
                    format!("{:.1}", gain_db_from_param(value))
                }))
                .with_string_to_value(Arc::new(|text: &str| {
                    let db: f32 = text.trim().trim_end_matches("dB").trim().parse().ok()?;
                    Some(((db + 50.0) / 50.0).clamp(0.0, 1.0))
                })),

            shared: Arc::new(RwLock::new(SharedPluginState::default())),
        }
    }
}

/// Path of the module this code is running from. The kernel library ships
/// next to it under the `<pluginbasename>lib` naming convention.
#[cfg(target_os = "windows")]
fn own_module_path() -> Option<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    unsafe {
        let mut module: HMODULE = 0;
        let addr = own_module_path as *const () as *const u16;
        let flags =
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT;
        if GetModuleHandleExW(flags, addr, &mut module) == 0 {
            return None;
        }

        let mut buf = vec![0u16; 1024];
        let len = GetModuleFileNameW(module, buf.as_mut_ptr(), buf.len() as u32);
        if len == 0 {
            return None;
        }
        buf.truncate(len as usize);
        Some(PathBuf::from(OsString::from_wide(&buf)))
    }
}

#[cfg(not(target_os = "windows"))]
fn own_module_path() -> Option<PathBuf> {
    None
}

fn resolve_kernel_module() -> Result<KernelModule, EngineError> {
    if let Ok(override_path) = std::env::var("IRBRIDGE_KERNEL_PATH") {
        return KernelModule::load(Path::new(&override_path));
    }

    match own_module_path() {
        Some(module) => KernelModule::load_for_plugin(&module),
        None => Err(EngineError::ModuleLoad {
            path: PathBuf::new(),
            reason: "cannot determine plugin module path; set IRBRIDGE_KERNEL_PATH".to_string(),
        }),
    }
}

impl IRBridgePlugin {
    fn request_load(&mut self, path: String) {
        if let Some(loader) = &self.loader {
            let _ = loader
                .tx
                .send(loader::LoaderCommand::LoadImpulse(PathBuf::from(&path)));
        }
        self.last_ir_path = path;
    }

    fn drain_loader_responses(&mut self) {
        let Some(loader) = &self.loader else { return };
        while let Ok(resp) = loader.rx.try_recv() {
            match resp {
                loader::LoaderResponse::Loading(path) => {
                    self.logger.detailed_info("Loader", &format!("Loading {}", path));
                }
                loader::LoaderResponse::Loaded(path) => {
                    self.logger.detailed_info("Loader", &format!("Active: {}", path));
                }
                loader::LoaderResponse::Error(msg) => {
                    self.logger.error("Loader", &msg);
                }
            }
        }
    }
}

impl Plugin for IRBridgePlugin {
    const NAME: &'static str = "IRBridge";
    const VENDOR: &'static str = "IRBridge Audio";
    const URL: &'static str = "https://github.com/irbridge/irbridge";
    const EMAIL: &'static str = "info@example.com";
    const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    const AUDIO_IO_LAYOUTS: &'static [AudioIOLayout] = &[AudioIOLayout {
        main_input_channels: NonZeroU32::new(ENGINE_CHANNELS as u32),
        main_output_channels: NonZeroU32::new(ENGINE_CHANNELS as u32),
        ..AudioIOLayout::const_default()
    }];

    type SysExMessage = ();
    type BackgroundTask = ();

    fn params(&self) -> Arc<dyn Params> {
        self.params.clone()
    }

    fn initialize(
        &mut self,
        _audio_io_layout: &AudioIOLayout,
        buffer_config: &BufferConfig,
        _context: &mut impl InitContext<Self>,
    ) -> bool {
        self.logger.info("Plugin", "Initializing...");
        info!("IRBridge: Initializing...");

        let block_size = buffer_config.max_buffer_size as usize;

        if self.adapter.is_none() {
            // Missing kernel module is fatal: report invalid to the host
            // rather than processing audio without an engine.
            let module = match resolve_kernel_module() {
                Ok(module) => module,
                Err(e) => {
                    self.logger.error("Kernel", &format!("Activation refused: {}", e));
                    return false;
                }
            };
            self.logger.info(
                "Kernel",
                &format!("Kernel module loaded: {:?}", module.path()),
            );

            let adapter = Arc::new(ConvolutionEngineAdapter::new(Arc::new(module), block_size));
            self.loader = Some(loader::Loader::new(
                Arc::clone(&adapter),
                Arc::clone(&self.logger),
            ));
            self.adapter = Some(adapter);
        } else if let Some(adapter) = &self.adapter {
            // Host renegotiated its buffering; stale engine state must be
            // rebuilt, not silently kept.
            if let Err(e) = adapter.set_block_size(block_size) {
                self.logger
                    .error("Engine", &format!("Block size rebuild failed: {}", e));
            }
        }

        self.scratch_input = vec![vec![0.0; block_size]; ENGINE_CHANNELS];
        self.scratch_output = vec![vec![0.0; block_size]; ENGINE_CHANNELS];

        // Restore the persisted impulse response once per instance.
        let path = self.params.shared.read().ir_path.clone();
        if !self.init_load_triggered && !path.is_empty() {
            self.init_load_triggered = true;
            self.logger
                .info("Persistence", &format!("Restoring impulse response: {}", path));
            self.request_load(path);
        }

        true
    }

    fn deactivate(&mut self) {
        self.logger.info("Plugin", "Deactivating...");
        self.logger.flush();
    }

    fn process(
        &mut self,
        buffer: &mut Buffer,
        _aux: &mut AuxiliaryBuffers,
        _context: &mut impl ProcessContext<Self>,
    ) -> ProcessStatus {
        let Some(adapter) = self.adapter.clone() else {
            return ProcessStatus::Normal;
        };

        adapter.set_enabled(self.params.enabled.value());
        adapter.set_gain_param(self.params.gain.value());

        // Program change: a new path in shared state triggers a reload on
        // the background thread.
        let path = self.params.shared.read().ir_path.clone();
        if path != self.last_ir_path {
            if path.is_empty() {
                self.last_ir_path.clear();
            } else {
                self.logger
                    .detailed_info("Preset", &format!("Program change -> {}", path));
                self.request_load(path);
            }
        }

        self.drain_loader_responses();

        let samples = buffer.samples();
        if self.scratch_input.is_empty() || samples > self.scratch_input[0].len() {
            return ProcessStatus::Normal;
        }

        // Planar adaptation: host buffer -> scratch, engine, scratch -> host.
        for (s, frame) in buffer.iter_samples().enumerate() {
            for (c, sample) in frame.into_iter().enumerate() {
                if c < ENGINE_CHANNELS {
                    self.scratch_input[c][s] = *sample;
                }
            }
        }

        {
            let inputs: [&[f32]; ENGINE_CHANNELS] = [
                &self.scratch_input[0][..samples],
                &self.scratch_input[1][..samples],
            ];
            let (left, right) = self.scratch_output.split_at_mut(1);
            let mut outputs: [&mut [f32]; ENGINE_CHANNELS] =
                [&mut left[0][..samples], &mut right[0][..samples]];
            adapter.process(&inputs, &mut outputs);
        }

        for (s, frame) in buffer.iter_samples().enumerate() {
            for (c, sample) in frame.into_iter().enumerate() {
                if c < ENGINE_CHANNELS {
                    *sample = self.scratch_output[c][s];
                }
            }
        }

        ProcessStatus::Normal
    }
}

impl ClapPlugin for IRBridgePlugin {
    const CLAP_ID: &'static str = "com.irbridge.convolver";
    const CLAP_DESCRIPTION: Option<&'static str> =
        Some("Impulse response convolution with glitch-free hot reload");
    const CLAP_MANUAL_URL: Option<&'static str> = None;
    const CLAP_SUPPORT_URL: Option<&'static str> = None;
    const CLAP_FEATURES: &'static [ClapFeature] = &[ClapFeature::AudioEffect, ClapFeature::Stereo];
}

impl Vst3Plugin for IRBridgePlugin {
    const VST3_CLASS_ID: [u8; 16] = *b"IRBridgeConvolvr";
    const VST3_SUBCATEGORIES: &'static [Vst3SubCategory] =
        &[Vst3SubCategory::Fx, Vst3SubCategory::Reverb];
}

nih_export_clap!(IRBridgePlugin);
nih_export_vst3!(IRBridgePlugin);
