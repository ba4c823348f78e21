//! OrderBell - audible new-order notifications.

mod audio;
mod config;
mod record;
mod sound;
mod store;
mod watcher;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::{AppConfig, ConfigManager};
use record::{append_record, Record};
use sound::{Chime, SoundConfigUpdate, SoundType, Synthesizer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use store::LocalStore;
use watcher::OrderWatcher;

// Global flags
static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

// Extra time for the output stream to drain before the process exits
const PLAYBACK_GRACE: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(name = "orderbell", version, about)]
struct CliArgs {
    /// Configuration file, defaults to the platform config directory.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plays a notification sound whenever a new order for the owner appears.
    Watch {
        #[clap(long)]
        owner: String,
    },

    /// Plays one notification sound.
    Play {
        /// Sound to play instead of the configured one.
        #[clap(long)]
        sound: Option<SoundType>,
    },

    /// Updates the notification sound settings, then shows them.
    SoundConfig {
        /// Clears the stored settings before applying the others.
        #[clap(long)]
        reset: bool,

        #[clap(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        volume: Option<u8>,

        #[clap(long)]
        sound: Option<SoundType>,
    },

    /// Appends an order to the watched collection, as the order flow would.
    Append {
        #[clap(long)]
        owner: String,

        /// Creation time (RFC 3339), defaults to now.
        #[clap(long)]
        at: Option<DateTime<Utc>>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(CliArgs::parse()) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> Result<()> {
    let config_manager = args
        .config
        .map(ConfigManager::with_path)
        .unwrap_or_default();
    let config = config_manager.load();
    log::debug!("Configuration loaded from {}", config_manager.path().display());

    let store = LocalStore::with_scan_interval(&config.store_dir, config.event_scan_interval())
        .with_context(|| format!("Failed to open store at {}", config.store_dir.display()))?;
    log::debug!("Store opened at {}", store.dir().display());

    match args.command {
        Command::Watch { owner } => watch(&store, &config, &owner),
        Command::Play { sound } => {
            let synth = Synthesizer::new(store);
            let sound_config = synth.get_config();
            synth.play(sound);
            if sound_config.volume > 0 {
                let sound = sound.unwrap_or(sound_config.sound_type);
                thread::sleep(sound.cue_duration() + PLAYBACK_GRACE);
            }
            Ok(())
        }
        Command::SoundConfig {
            reset,
            volume,
            sound,
        } => {
            let synth = Synthesizer::new(store);
            if reset {
                synth
                    .reset_config()
                    .context("Failed to reset sound settings")?;
            }
            synth
                .save_config(SoundConfigUpdate {
                    volume,
                    sound_type: sound,
                })
                .context("Failed to save sound settings")?;

            let current = synth.get_config();
            println!("volume: {}", current.volume);
            println!("sound: {}", current.sound_type);
            Ok(())
        }
        Command::Append { owner, at } => {
            if owner.is_empty() {
                bail!("An owner id is required");
            }
            let record = Record::new(owner, at.unwrap_or_else(Utc::now));
            let count = append_record(&store, &config.collection_key, &record)
                .with_context(|| format!("Failed to append to {:?}", config.collection_key))?;
            println!(
                "Appended order for {} ({} record(s) in {:?})",
                record.owner_id, count, config.collection_key
            );
            Ok(())
        }
    }
}

fn watch(store: &LocalStore, config: &AppConfig, owner: &str) -> Result<()> {
    ctrlc::set_handler(|| SHOULD_EXIT.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    let chime: Arc<dyn Chime> = Arc::new(Synthesizer::new(store.clone()));
    let Some(mut watcher) = OrderWatcher::start(store, chime, owner, config.watcher_options())
    else {
        bail!("An owner id is required to watch orders");
    };

    log::info!("OrderBell running");

    while !SHOULD_EXIT.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    log::info!("OrderBell shutting down...");
    watcher.stop();
    log::info!("OrderBell stopped");
    Ok(())
}
