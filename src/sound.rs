//! Sound module for new-order notifications.
//!
//! Synthesizes short cues from fixed tone profiles. Volume and profile
//! are read from the shared store on every play, so a change made in
//! any context applies everywhere.

use crate::audio::{AudioOutput, DeviceOutput, OutputFactory, ScheduledTone};
use crate::store::{LocalStore, StoreError};
use once_cell::sync::OnceCell;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Store key of the notification volume (0-100).
pub const VOLUME_KEY: &str = "notification-volume";
/// Store key of the notification sound type.
pub const SOUND_TYPE_KEY: &str = "notification-sound-type";

pub const DEFAULT_VOLUME: u8 = 50;
pub const MAX_VOLUME: u8 = 100;

// Each tone starts at 90% of the previous one, overlapping its tail
const TONE_SPACING: f64 = 0.9;
// Gain at full volume
const MAX_GAIN: f64 = 0.5;

/// Available notification sounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoundType {
    Bell,
    Chime,
    Ding,
    #[default]
    Notification,
    Alert,
}

impl SoundType {
    pub const ALL: [SoundType; 5] = [
        SoundType::Bell,
        SoundType::Chime,
        SoundType::Ding,
        SoundType::Notification,
        SoundType::Alert,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SoundType::Bell => "bell",
            SoundType::Chime => "chime",
            SoundType::Ding => "ding",
            SoundType::Notification => "notification",
            SoundType::Alert => "alert",
        }
    }

    /// Tone sequence as (frequency Hz, duration s) pairs.
    pub fn profile(self) -> &'static [(f64, f64)] {
        match self {
            SoundType::Bell => &[(830.6, 0.30), (1046.5, 0.45)],
            SoundType::Chime => &[(1046.5, 0.15), (1318.5, 0.15), (1568.0, 0.15), (2093.0, 0.35)],
            SoundType::Ding => &[(1318.5, 0.40)],
            SoundType::Notification => &[(880.0, 0.15), (1174.7, 0.25)],
            SoundType::Alert => &[(987.8, 0.12), (740.0, 0.12), (987.8, 0.12)],
        }
    }

    /// How long the cue lasts from its first tone to the end of its last.
    pub fn cue_duration(self) -> Duration {
        let end = schedule(self, MAX_VOLUME)
            .iter()
            .map(ScheduledTone::end)
            .fold(0.0, f64::max);
        Duration::from_secs_f64(end)
    }
}

impl fmt::Display for SoundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("Unknown sound type: {0:?}")]
pub struct ParseSoundTypeError(String);

impl FromStr for SoundType {
    type Err = ParseSoundTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SoundType::ALL
            .into_iter()
            .find(|sound| sound.name() == s.trim())
            .ok_or_else(|| ParseSoundTypeError(s.to_string()))
    }
}

/// Lays out the tones of `sound` at `volume`.
pub fn schedule(sound: SoundType, volume: u8) -> Vec<ScheduledTone> {
    let peak_gain = f64::from(volume.min(MAX_VOLUME)) / 100.0 * MAX_GAIN;
    let mut start = 0.0;

    sound
        .profile()
        .iter()
        .map(|&(frequency, duration)| {
            let tone = ScheduledTone {
                frequency,
                start,
                duration,
                peak_gain,
            };
            start += duration * TONE_SPACING;
            tone
        })
        .collect()
}

/// Persisted sound settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundConfig {
    pub volume: u8,
    pub sound_type: SoundType,
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            sound_type: SoundType::default(),
        }
    }
}

/// Partial update of the sound settings. `None` fields are left as stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoundConfigUpdate {
    pub volume: Option<u8>,
    pub sound_type: Option<SoundType>,
}

/// Something that can play a notification cue.
pub trait Chime: Send + Sync {
    /// Plays `sound`, or the configured sound when `None`. Fire-and-forget.
    fn play(&self, sound: Option<SoundType>);
}

/// Tone synthesizer backed by the shared store.
pub struct Synthesizer {
    store: LocalStore,
    factory: OutputFactory,
    /// `Some(None)` once creation failed; never retried.
    output: OnceCell<Option<Arc<dyn AudioOutput>>>,
}

impl Synthesizer {
    /// Creates a synthesizer playing on the default output device.
    pub fn new(store: LocalStore) -> Self {
        Self::with_output_factory(
            store,
            Box::new(|| DeviceOutput::open().map(|output| Arc::new(output) as Arc<dyn AudioOutput>)),
        )
    }

    /// Creates a synthesizer with a custom output. The factory runs at most once.
    pub fn with_output_factory(store: LocalStore, factory: OutputFactory) -> Self {
        Self {
            store,
            factory,
            output: OnceCell::new(),
        }
    }

    /// Reads the sound settings, falling back to defaults for missing or
    /// unreadable values.
    pub fn get_config(&self) -> SoundConfig {
        let defaults = SoundConfig::default();

        let volume = self
            .read(VOLUME_KEY)
            .and_then(|raw| match raw.trim().parse::<i64>() {
                Ok(volume) => Some(volume.clamp(0, i64::from(MAX_VOLUME)) as u8),
                Err(e) => {
                    log::warn!("Invalid stored volume {:?}: {}", raw, e);
                    None
                }
            })
            .unwrap_or(defaults.volume);

        let sound_type = self
            .read(SOUND_TYPE_KEY)
            .and_then(|raw| match raw.parse::<SoundType>() {
                Ok(sound_type) => Some(sound_type),
                Err(e) => {
                    log::warn!("{}", e);
                    None
                }
            })
            .unwrap_or(defaults.sound_type);

        SoundConfig { volume, sound_type }
    }

    /// Writes the supplied settings.
    pub fn save_config(&self, update: SoundConfigUpdate) -> Result<(), StoreError> {
        if let Some(volume) = update.volume {
            self.store
                .set_item(VOLUME_KEY, &volume.min(MAX_VOLUME).to_string())?;
        }
        if let Some(sound_type) = update.sound_type {
            self.store.set_item(SOUND_TYPE_KEY, sound_type.name())?;
        }
        Ok(())
    }

    /// Removes the stored settings so every context falls back to defaults.
    pub fn reset_config(&self) -> Result<(), StoreError> {
        self.store.remove_item(VOLUME_KEY)?;
        self.store.remove_item(SOUND_TYPE_KEY)
    }

    /// Plays a cue. Silent at volume 0 or without an audio output.
    pub fn play(&self, sound: Option<SoundType>) {
        let config = self.get_config();
        if config.volume == 0 {
            log::debug!("Volume is 0, not playing");
            return;
        }

        let Some(output) = self.output() else {
            return;
        };

        let sound = sound.unwrap_or(config.sound_type);
        log::debug!("Playing {} at volume {}", sound, config.volume);
        output.play(schedule(sound, config.volume));
    }

    fn output(&self) -> Option<&Arc<dyn AudioOutput>> {
        self.output
            .get_or_init(|| match (self.factory)() {
                Ok(output) => Some(output),
                Err(e) => {
                    log::warn!("Audio unavailable, notification sounds disabled: {}", e);
                    None
                }
            })
            .as_ref()
    }

    fn read(&self, key: &str) -> Option<String> {
        self.store.get_item(key).unwrap_or_else(|e| {
            log::warn!("Failed to read {}: {}", key, e);
            None
        })
    }
}

impl Chime for Synthesizer {
    fn play(&self, sound: Option<SoundType>) {
        Synthesizer::play(self, sound);
    }
}
