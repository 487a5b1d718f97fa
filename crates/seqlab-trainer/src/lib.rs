//! # Seqlab Trainer
//!
//! Training and prediction pipelines around the seqlab-core models:
//! command-line configuration, checkpoints and the processors that run
//! fit / evaluate / predict over datasets.

pub mod checkpoint;
pub mod config;
pub mod optim;
pub mod tagger;
pub mod translator;

pub use checkpoint::Checkpoint;
pub use config::{CommonArgs, Mode, TaggerArgs, TransformerArgs};
pub use tagger::{TaggerMetrics, TaggerModel, TaggerProcessor};
pub use translator::{Translation, TranslatorMetrics, TranslatorModel, TranslatorProcessor, TranslatorShape};

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;

use anyhow::Context;
use candle_core::Device;
use tracing::{Level, debug};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::fmt::format::{DefaultFields, Format};

/// Log output goes to stderr; stdout is reserved for results.
type LogBuilder = SubscriberBuilder<DefaultFields, Format, LevelFilter, fn() -> io::Stderr>;

fn log_builder(verbosity: u8) -> LogBuilder {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr as fn() -> io::Stderr)
}

/// Install the global `tracing` subscriber on stderr. `verbosity` counts
/// `-v` flags.
pub fn init_logging(verbosity: u8) {
    log_builder(verbosity).init();
}

/// Create `path` for writing, along with any missing parent directories.
pub fn create_output<P: AsRef<Path>>(path: P) -> anyhow::Result<BufWriter<File>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Seed the device RNG used for initialization and dropout.
///
/// The CPU backend draws from a thread-local generator that candle does not
/// expose, so only accelerator devices are seeded; shuffling and teacher
/// forcing are seeded separately through the processors.
pub fn seed_everything(device: &Device, seed: u64) -> candle_core::Result<()> {
    if device.is_cpu() {
        debug!(seed, "CPU device RNG is not seedable");
        Ok(())
    } else {
        device.set_seed(seed)
    }
}
