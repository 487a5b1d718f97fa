//! Checkpoint files: `<path>.safetensors` holds the weights of a `VarMap`,
//! `<path>.json` the hyperparameters and vocabularies needed to rebuild it.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_nn::VarMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Checkpoint {
    base: PathBuf,
}

impl Checkpoint {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn weights_path(&self) -> PathBuf {
        self.with_suffix(".safetensors")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.with_suffix(".json")
    }

    // Appended rather than `with_extension` so `model.v2` keeps its dot.
    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.base.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Whether both files are present.
    pub fn exists(&self) -> bool {
        self.weights_path().is_file() && self.metadata_path().is_file()
    }

    /// Write weights and metadata, creating parent directories as needed.
    pub fn save<M: Serialize>(&self, varmap: &VarMap, metadata: &M) -> Result<()> {
        if let Some(parent) = self.base.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
        }

        let weights = self.weights_path();
        varmap
            .save(&weights)
            .with_context(|| format!("writing weights to {}", weights.display()))?;

        let meta = self.metadata_path();
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(&meta, json).with_context(|| format!("writing metadata to {}", meta.display()))?;

        info!("Checkpoint saved to {}", self.base.display());
        Ok(())
    }

    pub fn load_metadata<M: DeserializeOwned>(&self) -> Result<M> {
        let meta = self.metadata_path();
        let json = fs::read_to_string(&meta)
            .with_context(|| format!("reading checkpoint metadata {}", meta.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parsing checkpoint metadata {}", meta.display()))
    }

    /// Overwrite every variable of `varmap` with the stored weights.
    pub fn load_weights(&self, varmap: &mut VarMap) -> Result<()> {
        let weights = self.weights_path();
        varmap
            .load(&weights)
            .with_context(|| format!("reading weights from {}", weights.display()))
    }
}
