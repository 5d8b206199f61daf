//! The producer/consumer discipline around the convolution engine.
//!
//! One real-time thread calls [`ConvolutionEngineAdapter::process`] at a
//! fixed cadence; control threads call `reconfigure`/`set_block_size` at
//! arbitrary times. The contract: the audio thread never observes a
//! half-built or being-destroyed engine, and never waits on slow control
//! work. The mechanism is a single mutex-guarded engine slot plus an eager
//! `bypass` flag the audio thread reads lock-free.

use log::info;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::EngineError;
use crate::ir::ImpulseResponse;
use crate::kernel::{ConvolutionKernel, KernelInstance};
use crate::ENGINE_CHANNELS;

/// Host gain parameter (0..1) to decibels: full scale is unity, the bottom
/// of the range is -50 dB.
#[inline]
pub fn gain_db_from_param(value: f32) -> f32 {
    50.0 * value - 50.0
}

/// Host gain parameter (0..1) to a linear factor.
#[inline]
pub fn gain_factor_from_param(value: f32) -> f32 {
    10.0f32.powf(gain_db_from_param(value) / 20.0)
}

/// Everything the control path mutates under the lock. The engine slot is
/// the single shared resource: at most one live engine, owned here.
struct EngineSlot {
    engine: Option<Box<dyn KernelInstance>>,
    block_size: usize,
    source: Option<PathBuf>,
}

pub struct ConvolutionEngineAdapter {
    kernel: Arc<dyn ConvolutionKernel>,
    slot: Mutex<EngineSlot>,
    /// True whenever no engine is ready or a reconfigure is in flight. Set
    /// eagerly (before the lock is taken) so the audio thread bails out to
    /// pass-through without waiting on file I/O or FFT planning.
    bypass: AtomicBool,
    enabled: AtomicBool,
    /// Linear post-gain factor, stored as f32 bits.
    gain_factor: AtomicU32,
}

impl ConvolutionEngineAdapter {
    pub fn new(kernel: Arc<dyn ConvolutionKernel>, block_size: usize) -> Self {
        Self {
            kernel,
            slot: Mutex::new(EngineSlot {
                engine: None,
                block_size,
                source: None,
            }),
            bypass: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            gain_factor: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    /// Tear down the current engine (if any) and rebuild it from the given
    /// impulse response file. Reloading the already-active source is a no-op.
    ///
    /// Runs to completion before another reconfigure is accepted; concurrent
    /// callers serialize on the slot lock. Any failure leaves the adapter in
    /// a valid bypass state with no engine.
    pub fn reconfigure(&self, path: &Path) -> Result<(), EngineError> {
        {
            let slot = self.slot.lock();
            if slot.engine.is_some() && slot.source.as_deref() == Some(path) {
                return Ok(());
            }
        }

        // Eager: let the audio thread fall back to pass-through before we
        // start the slow work below.
        self.bypass.store(true, Ordering::Release);

        let mut slot = self.slot.lock();
        // The old engine must be fully destroyed before the replacement is
        // requested, so at most one instance is ever live.
        slot.engine = None;

        match self.build_engine(&mut slot, path) {
            Ok(frames) => {
                info!(
                    "engine ready: {:?} ({} frames @ block {})",
                    path, frames, slot.block_size
                );
                self.bypass.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                slot.source = None;
                Err(e)
            }
        }
    }

    /// Adopt a new host block size. No-op when the size is unchanged and an
    /// engine is already built for it. Otherwise the engine is rebuilt from
    /// the remembered source, or the adapter stays in bypass at the new size
    /// when nothing was loaded yet.
    ///
    /// Precondition: hosts serialize block-size changes with processing;
    /// this call still takes the slot lock, so a violation degrades to
    /// pass-through rather than corruption.
    pub fn set_block_size(&self, block_size: usize) -> Result<(), EngineError> {
        if block_size == 0 {
            return Ok(());
        }

        {
            let slot = self.slot.lock();
            if slot.block_size == block_size && slot.engine.is_some() {
                return Ok(());
            }
        }

        self.bypass.store(true, Ordering::Release);

        let mut slot = self.slot.lock();
        slot.engine = None;
        slot.block_size = block_size;

        let Some(path) = slot.source.clone() else {
            // Nothing loaded yet; the next reconfigure picks up the new size.
            return Ok(());
        };

        match self.build_engine(&mut slot, &path) {
            Ok(_) => {
                info!("engine rebuilt for block {}", block_size);
                self.bypass.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                slot.source = None;
                Err(e)
            }
        }
    }

    /// Load + initialize under the already-held lock. Caller decides what
    /// happens to `bypass`.
    fn build_engine(
        &self,
        slot: &mut EngineSlot,
        path: &Path,
    ) -> Result<usize, EngineError> {
        let ir = ImpulseResponse::load(path)?;
        let engine = self
            .kernel
            .instantiate(slot.block_size, ENGINE_CHANNELS, &ir)?;
        // The kernel copied the sample data during init; `ir` drops here.
        let frames = ir.frames;
        slot.engine = Some(engine);
        slot.source = Some(path.to_path_buf());
        Ok(frames)
    }

    /// The real-time path. Pass-through when disabled, bypassed, or the
    /// slot lock is contended; otherwise one kernel block plus post-gain.
    /// Never blocks, never allocates, never reports errors upward.
    pub fn process(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
        if !self.enabled.load(Ordering::Relaxed) || self.bypass.load(Ordering::Acquire) {
            pass_through(inputs, outputs);
            return;
        }

        // Non-blocking attempt only: if the control path holds the lock we
        // choose silence-free pass-through over missing the deadline.
        let Some(mut slot) = self.slot.try_lock() else {
            pass_through(inputs, outputs);
            return;
        };

        let Some(engine) = slot.engine.as_mut() else {
            // bypass covers this in steady state; guard anyway.
            pass_through(inputs, outputs);
            return;
        };

        if engine.process(inputs, outputs).is_err() {
            pass_through(inputs, outputs);
            return;
        }

        let factor = f32::from_bits(self.gain_factor.load(Ordering::Relaxed));
        if (factor - 1.0).abs() > f32::EPSILON {
            for ch in outputs.iter_mut() {
                for sample in ch.iter_mut() {
                    *sample *= factor;
                }
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Update the post-gain from the host's 0..1 parameter value.
    pub fn set_gain_param(&self, value: f32) {
        self.gain_factor
            .store(gain_factor_from_param(value).to_bits(), Ordering::Relaxed);
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass.load(Ordering::Acquire)
    }

    pub fn block_size(&self) -> usize {
        self.slot.lock().block_size
    }

    /// The loaded source path for program-name reporting, or "default" when
    /// nothing is loaded.
    pub fn source_name(&self) -> String {
        self.slot
            .lock()
            .source
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string())
    }
}

#[inline]
fn pass_through(inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
    for (out, inp) in outputs.iter_mut().zip(inputs.iter()) {
        let n = out.len().min(inp.len());
        out[..n].copy_from_slice(&inp[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Direct time-domain convolver standing in for the native kernel.
    struct DirectKernel {
        instantiations: AtomicUsize,
        init_delay: Duration,
    }

    impl DirectKernel {
        fn new() -> Self {
            Self {
                instantiations: AtomicUsize::new(0),
                init_delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                instantiations: AtomicUsize::new(0),
                init_delay: delay,
            }
        }

        fn instantiation_count(&self) -> usize {
            self.instantiations.load(Ordering::SeqCst)
        }
    }

    impl ConvolutionKernel for DirectKernel {
        fn instantiate(
            &self,
            _block_size: usize,
            channels: usize,
            ir: &ImpulseResponse,
        ) -> Result<Box<dyn KernelInstance>, EngineError> {
            self.instantiations.fetch_add(1, Ordering::SeqCst);
            if !self.init_delay.is_zero() {
                std::thread::sleep(self.init_delay);
            }
            Ok(Box::new(DirectEngine {
                ir: ir.channels.clone(),
                history: std::array::from_fn(|_| vec![0.0; ir.frames.saturating_sub(1)]),
                channels,
            }))
        }
    }

    struct DirectEngine {
        ir: [Vec<f32>; 2],
        history: [Vec<f32>; 2],
        channels: usize,
    }

    impl KernelInstance for DirectEngine {
        fn process(
            &mut self,
            inputs: &[&[f32]],
            outputs: &mut [&mut [f32]],
        ) -> Result<(), EngineError> {
            for c in 0..self.channels {
                let ir = &self.ir[c];
                let mut signal = std::mem::take(&mut self.history[c]);
                signal.extend_from_slice(inputs[c]);

                let tail = ir.len() - 1;
                for (n, out) in outputs[c].iter_mut().enumerate() {
                    let pos = tail + n;
                    let mut acc = 0.0;
                    for (k, &coeff) in ir.iter().enumerate() {
                        acc += coeff * signal[pos - k];
                    }
                    *out = acc;
                }

                signal.drain(..signal.len() - tail);
                self.history[c] = signal;
            }
            Ok(())
        }
    }

    struct FailingKernel;

    impl ConvolutionKernel for FailingKernel {
        fn instantiate(
            &self,
            block_size: usize,
            channels: usize,
            ir: &ImpulseResponse,
        ) -> Result<Box<dyn KernelInstance>, EngineError> {
            Err(EngineError::EngineInit {
                block_size,
                channels,
                ir_len: ir.frames,
            })
        }
    }

    fn write_ir(dir: &Path, name: &str, samples: &[f32]) -> PathBuf {
        let path = dir.join(name);
        let spec = WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn run_block(adapter: &ConvolutionEngineAdapter, input: &[f32]) -> [Vec<f32>; 2] {
        let mut out_l = vec![0.0; input.len()];
        let mut out_r = vec![0.0; input.len()];
        {
            let inputs: [&[f32]; 2] = [input, input];
            let mut outputs: [&mut [f32]; 2] = [&mut out_l, &mut out_r];
            adapter.process(&inputs, &mut outputs);
        }
        [out_l, out_r]
    }

    #[test]
    fn starts_bypassed_with_pass_through() {
        let adapter = ConvolutionEngineAdapter::new(Arc::new(DirectKernel::new()), 64);
        assert!(adapter.is_bypassed());
        assert_eq!(adapter.source_name(), "default");

        let input: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
        let [l, r] = run_block(&adapter, &input);
        assert_eq!(l, input);
        assert_eq!(r, input);
    }

    #[test]
    fn unit_impulse_reproduces_impulse_response() {
        let dir = tempfile::tempdir().unwrap();
        let ir_samples = [0.5, 0.25, -0.125, 0.0625];
        let path = write_ir(dir.path(), "ir.wav", &ir_samples);

        let adapter = ConvolutionEngineAdapter::new(Arc::new(DirectKernel::new()), 8);
        adapter.reconfigure(&path).unwrap();
        assert!(!adapter.is_bypassed());
        assert_eq!(adapter.source_name(), path.to_string_lossy());

        let mut impulse = vec![0.0; 8];
        impulse[0] = 1.0;
        let [l, r] = run_block(&adapter, &impulse);
        for c in [&l, &r] {
            for (i, &expected) in ir_samples.iter().enumerate() {
                assert!((c[i] - expected).abs() < 1e-6, "frame {}: {}", i, c[i]);
            }
        }
    }

    #[test]
    fn gain_mapping_round_trip() {
        assert!((gain_db_from_param(1.0) - 0.0).abs() < 1e-6);
        assert!((gain_factor_from_param(1.0) - 1.0).abs() < 1e-6);
        assert!((gain_db_from_param(0.0) + 50.0).abs() < 1e-6);
        assert!((gain_factor_from_param(0.0) - 0.0031623).abs() < 1e-5);
    }

    #[test]
    fn post_gain_scales_convolved_output_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ir(dir.path(), "unit.wav", &[1.0]);

        let adapter = ConvolutionEngineAdapter::new(Arc::new(DirectKernel::new()), 4);
        adapter.reconfigure(&path).unwrap();
        adapter.set_gain_param(0.5); // -25 dB

        let input = vec![1.0; 4];
        let [l, _] = run_block(&adapter, &input);
        let expected = gain_factor_from_param(0.5);
        for &s in &l {
            assert!((s - expected).abs() < 1e-6);
        }

        // Bypass path stays unmodified regardless of gain.
        adapter.set_enabled(false);
        let [l, _] = run_block(&adapter, &input);
        assert_eq!(l, input);
    }

    #[test]
    fn invalid_file_leaves_bypass_and_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ConvolutionEngineAdapter::new(Arc::new(DirectKernel::new()), 16);

        let missing = dir.path().join("missing.wav");
        assert!(matches!(
            adapter.reconfigure(&missing),
            Err(EngineError::Load { .. })
        ));
        assert!(adapter.is_bypassed());
        assert_eq!(adapter.source_name(), "default");

        let input: Vec<f32> = (0..16).map(|i| (i as f32).sin()).collect();
        let [l, _] = run_block(&adapter, &input);
        assert_eq!(l, input);
    }

    #[test]
    fn failed_reload_tears_down_previous_engine() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_ir(dir.path(), "good.wav", &[1.0]);
        let adapter = ConvolutionEngineAdapter::new(Arc::new(DirectKernel::new()), 8);
        adapter.reconfigure(&good).unwrap();

        let missing = dir.path().join("missing.wav");
        assert!(adapter.reconfigure(&missing).is_err());
        // The old engine is gone; the adapter is back in bypass, not Ready.
        assert!(adapter.is_bypassed());

        let input = vec![0.5; 8];
        let [l, _] = run_block(&adapter, &input);
        assert_eq!(l, input);
    }

    #[test]
    fn engine_init_refusal_reports_and_bypasses() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ir(dir.path(), "ir.wav", &[1.0, 0.5]);

        let adapter = ConvolutionEngineAdapter::new(Arc::new(FailingKernel), 32);
        assert!(matches!(
            adapter.reconfigure(&path),
            Err(EngineError::EngineInit {
                block_size: 32,
                channels: 2,
                ir_len: 2,
            })
        ));
        assert!(adapter.is_bypassed());
    }

    #[test]
    fn reconfigure_same_source_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ir(dir.path(), "ir.wav", &[1.0]);

        let kernel = Arc::new(DirectKernel::new());
        let adapter = ConvolutionEngineAdapter::new(kernel.clone(), 8);
        adapter.reconfigure(&path).unwrap();
        adapter.reconfigure(&path).unwrap();
        assert_eq!(kernel.instantiation_count(), 1);
    }

    #[test]
    fn block_size_change_rebuilds_loaded_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ir(dir.path(), "ir.wav", &[2.0]);

        let kernel = Arc::new(DirectKernel::new());
        let adapter = ConvolutionEngineAdapter::new(kernel.clone(), 64);
        adapter.reconfigure(&path).unwrap();

        adapter.set_block_size(128).unwrap();
        assert_eq!(adapter.block_size(), 128);
        assert!(!adapter.is_bypassed());
        assert_eq!(kernel.instantiation_count(), 2);

        // Unchanged size with a live engine: nothing rebuilt.
        adapter.set_block_size(128).unwrap();
        assert_eq!(kernel.instantiation_count(), 2);

        let input = vec![1.0; 128];
        let [l, _] = run_block(&adapter, &input);
        assert!(l.iter().all(|&s| (s - 2.0).abs() < 1e-6));
    }

    #[test]
    fn block_size_change_without_source_stays_bypass() {
        let adapter = ConvolutionEngineAdapter::new(Arc::new(DirectKernel::new()), 64);
        adapter.set_block_size(256).unwrap();
        assert_eq!(adapter.block_size(), 256);
        assert!(adapter.is_bypassed());
    }

    /// Reconfigure with a deliberately slow kernel while another thread
    /// hammers process(). Single-tap IRs make every valid block uniform, so
    /// any mixed or partial block would expose a torn engine swap.
    #[test]
    fn concurrent_reconfigure_never_corrupts_process() {
        let dir = tempfile::tempdir().unwrap();
        let ir_a = write_ir(dir.path(), "a.wav", &[2.0]);
        let ir_b = write_ir(dir.path(), "b.wav", &[3.0]);

        let kernel = Arc::new(DirectKernel::slow(Duration::from_millis(2)));
        let adapter = Arc::new(ConvolutionEngineAdapter::new(kernel, 32));

        let audio = {
            let adapter = Arc::clone(&adapter);
            std::thread::spawn(move || {
                let input = vec![1.0; 32];
                for _ in 0..2000 {
                    let [l, r] = run_block(&adapter, &input);
                    for block in [&l, &r] {
                        let first = block[0];
                        assert!(
                            (first - 1.0).abs() < 1e-6
                                || (first - 2.0).abs() < 1e-6
                                || (first - 3.0).abs() < 1e-6,
                            "unexpected sample {}",
                            first
                        );
                        assert!(
                            block.iter().all(|&s| (s - first).abs() < 1e-6),
                            "mixed block: {:?}",
                            block
                        );
                    }
                }
            })
        };

        for i in 0..40 {
            let path = if i % 2 == 0 { &ir_a } else { &ir_b };
            adapter.reconfigure(path).unwrap();
        }

        audio.join().unwrap();
    }
}
