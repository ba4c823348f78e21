//! Audio module.
//!
//! Renders scheduled tones to samples and plays them on the default
//! output device through cpal. No audio files are involved.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::f64::consts::PI;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Gain every tone decays to by the end of its duration.
pub const DECAY_FLOOR: f64 = 0.01;

// Silence kept running after the last tone so the device drains its buffer
const STREAM_TAIL: Duration = Duration::from_millis(150);

/// Errors that can occur while opening or driving the output device.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("No default audio output device")]
    NoDevice,

    #[error("Output device has no usable config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("Unsupported sample format: {0:?}")]
    UnsupportedFormat(SampleFormat),

    #[error("Failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// One tone of a cue, positioned on the cue's own clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledTone {
    /// Frequency in Hz.
    pub frequency: f64,
    /// Offset from the start of the cue, in seconds.
    pub start: f64,
    /// Duration in seconds.
    pub duration: f64,
    /// Gain at the start of the tone.
    pub peak_gain: f64,
}

impl ScheduledTone {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Envelope gain `t` seconds into the tone.
    ///
    /// Exponential decay from `peak_gain` to `DECAY_FLOOR` over the duration.
    pub fn gain_at(&self, t: f64) -> f64 {
        if self.peak_gain <= 0.0 || !(0.0..=self.duration).contains(&t) {
            return 0.0;
        }
        self.peak_gain * (DECAY_FLOOR / self.peak_gain).powf(t / self.duration)
    }
}

/// Mixes `tones` into mono samples in `-1.0..=1.0` at `sample_rate`.
pub fn render(tones: &[ScheduledTone], sample_rate: u32) -> Vec<f32> {
    let rate = f64::from(sample_rate);
    let total = tones.iter().map(ScheduledTone::end).fold(0.0, f64::max);
    let mut mix = vec![0.0_f64; (total * rate).ceil() as usize];

    for tone in tones {
        let first = (tone.start * rate).round() as usize;
        let count = (tone.duration * rate).round() as usize;
        for n in 0..count {
            let Some(slot) = mix.get_mut(first + n) else {
                break;
            };
            let t = n as f64 / rate;
            *slot += tone.gain_at(t) * (2.0 * PI * tone.frequency * t).sin();
        }
    }

    mix.into_iter().map(|s| s.clamp(-1.0, 1.0) as f32).collect()
}

/// Writes mono `samples` from `position` into interleaved `frames`,
/// padding with silence once they run out. Returns the new position.
fn fill_frames<T>(frames: &mut [T], channels: usize, samples: &[f32], position: usize) -> usize
where
    T: SizedSample + FromSample<f32>,
{
    let mut position = position;
    for frame in frames.chunks_mut(channels.max(1)) {
        let value = samples.get(position).copied().unwrap_or(0.0);
        position += 1;
        for sample in frame.iter_mut() {
            *sample = T::from_sample(value);
        }
    }
    position
}

/// Output device for synthesized cues.
pub trait AudioOutput: Send + Sync {
    /// Schedules `tones` for playback and returns immediately.
    fn play(&self, tones: Vec<ScheduledTone>);
}

/// Creates the audio output on first use.
pub type OutputFactory = Box<dyn Fn() -> Result<Arc<dyn AudioOutput>, AudioError> + Send + Sync>;

/// Default output device of the default cpal host.
pub struct DeviceOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl DeviceOutput {
    /// Opens the default output device, failing when the environment has none.
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let supported = device.default_output_config()?;
        let sample_format = supported.sample_format();

        if !matches!(
            sample_format,
            SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
        ) {
            return Err(AudioError::UnsupportedFormat(sample_format));
        }

        log::debug!(
            "Using audio device {} ({:?}, {} Hz)",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_format,
            supported.sample_rate().0
        );

        Ok(Self {
            device,
            config: supported.config(),
            sample_format,
        })
    }

    fn build_stream(&self, samples: Vec<f32>) -> Result<Stream, AudioError> {
        match self.sample_format {
            SampleFormat::F32 => self.build_typed_stream::<f32>(samples),
            SampleFormat::I16 => self.build_typed_stream::<i16>(samples),
            SampleFormat::U16 => self.build_typed_stream::<u16>(samples),
            other => Err(AudioError::UnsupportedFormat(other)),
        }
    }

    fn build_typed_stream<T>(&self, samples: Vec<f32>) -> Result<Stream, AudioError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = usize::from(self.config.channels);
        let mut position = 0;

        let stream = self.device.build_output_stream(
            &self.config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                position = fill_frames(data, channels, &samples, position);
            },
            |e| log::warn!("Audio stream error: {}", e),
            None,
        )?;
        Ok(stream)
    }

    /// Plays `tones` to the end on the calling thread.
    fn play_blocking(&self, tones: &[ScheduledTone]) -> Result<(), AudioError> {
        let samples = render(tones, self.config.sample_rate.0);
        let end = tones.iter().map(ScheduledTone::end).fold(0.0, f64::max);
        let length = Duration::from_secs_f64(end);

        let stream = self.build_stream(samples)?;
        stream.play()?;
        thread::sleep(length + STREAM_TAIL);
        Ok(())
    }
}

impl AudioOutput for DeviceOutput {
    fn play(&self, tones: Vec<ScheduledTone>) {
        let output = Self {
            device: self.device.clone(),
            config: self.config.clone(),
            sample_format: self.sample_format,
        };

        // Streams are not Send, each cue gets its own on its own thread
        let spawned = thread::Builder::new()
            .name("tone-playback".to_string())
            .spawn(move || {
                if let Err(e) = output.play_blocking(&tones) {
                    log::warn!("Tone playback failed: {}", e);
                }
            });

        if let Err(e) = spawned {
            log::warn!("Failed to start tone playback: {}", e);
        }
    }
}
