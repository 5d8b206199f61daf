use hound::{SampleFormat, WavReader};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::ENGINE_CHANNELS;

/// A loaded impulse response: two channels of normalized float samples plus
/// the identity of the source file. Immutable once loaded; the adapter only
/// keeps it alive for the duration of a reconfigure.
#[derive(Debug, Clone)]
pub struct ImpulseResponse {
    pub channels: [Vec<f32>; 2],
    pub frames: usize,
    pub source: PathBuf,
}

impl ImpulseResponse {
    /// Read an impulse response from a WAV file.
    ///
    /// The supported format is deliberately narrow: IEEE float, 32 bits per
    /// sample, mono or stereo. Mono files are duplicated to both channels.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let load_err = |reason: String| EngineError::Load {
            path: path.to_path_buf(),
            reason,
        };

        let mut reader = WavReader::open(path).map_err(|e| load_err(e.to_string()))?;
        let spec = reader.spec();

        if spec.sample_format != SampleFormat::Float || spec.bits_per_sample != 32 {
            return Err(load_err(format!(
                "unsupported format: {:?} {}-bit (need 32-bit float)",
                spec.sample_format, spec.bits_per_sample
            )));
        }
        if spec.channels == 0 || spec.channels as usize > ENGINE_CHANNELS {
            return Err(load_err(format!(
                "unsupported channel count {} (need 1 or 2)",
                spec.channels
            )));
        }

        let frames = reader.duration() as usize;
        if frames == 0 {
            return Err(load_err("empty impulse response".to_string()));
        }

        let file_channels = spec.channels as usize;
        let mut channels = [
            Vec::with_capacity(frames),
            Vec::with_capacity(frames),
        ];

        // De-interleave. Any decode error at this point means a truncated or
        // corrupt data chunk.
        for (i, sample) in reader.samples::<f32>().enumerate() {
            let s = sample.map_err(|e| load_err(e.to_string()))?;
            channels[i % file_channels].push(s);
        }

        if channels[0].len() != frames || channels[file_channels - 1].len() != frames {
            return Err(load_err("truncated sample data".to_string()));
        }

        // Mono duplicated to both engine channels.
        if file_channels == 1 {
            channels[1] = channels[0].clone();
        }

        Ok(Self {
            channels,
            frames,
            source: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(
        dir: &Path,
        name: &str,
        channels: u16,
        format: SampleFormat,
        bits: u16,
        frames: &[f32],
    ) -> PathBuf {
        let path = dir.join(name);
        let spec = WavSpec {
            channels,
            sample_rate: 48000,
            bits_per_sample: bits,
            sample_format: format,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for &s in frames {
            match format {
                SampleFormat::Float => writer.write_sample(s).unwrap(),
                SampleFormat::Int => writer.write_sample((s * 32767.0) as i16).unwrap(),
            }
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn loads_stereo_float() {
        let dir = tempfile::tempdir().unwrap();
        // Interleaved L/R pairs
        let path = write_wav(
            dir.path(),
            "stereo.wav",
            2,
            SampleFormat::Float,
            32,
            &[1.0, -1.0, 0.5, -0.5],
        );

        let ir = ImpulseResponse::load(&path).unwrap();
        assert_eq!(ir.frames, 2);
        assert_eq!(ir.channels[0], vec![1.0, 0.5]);
        assert_eq!(ir.channels[1], vec![-1.0, -0.5]);
        assert_eq!(ir.source, path);
    }

    #[test]
    fn mono_is_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(
            dir.path(),
            "mono.wav",
            1,
            SampleFormat::Float,
            32,
            &[0.25, 0.75, -0.1],
        );

        let ir = ImpulseResponse::load(&path).unwrap();
        assert_eq!(ir.frames, 3);
        assert_eq!(ir.channels[0], ir.channels[1]);
        assert_eq!(ir.channels[0], vec![0.25, 0.75, -0.1]);
    }

    #[test]
    fn rejects_integer_pcm() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(
            dir.path(),
            "int16.wav",
            1,
            SampleFormat::Int,
            16,
            &[0.1, 0.2],
        );

        match ImpulseResponse::load(&path) {
            Err(EngineError::Load { .. }) => {}
            other => panic!("expected Load error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.wav");
        assert!(matches!(
            ImpulseResponse::load(&path),
            Err(EngineError::Load { .. })
        ));
    }

    #[test]
    fn rejects_too_many_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(
            dir.path(),
            "quad.wav",
            4,
            SampleFormat::Float,
            32,
            &[0.0; 8],
        );
        assert!(matches!(
            ImpulseResponse::load(&path),
            Err(EngineError::Load { .. })
        ));
    }
}
