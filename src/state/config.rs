/// Job configuration
///
/// Everything a restoration job needs to know up front: the model, tile
/// geometry, strength and the adaptive search settings. It is serialized
/// to JSON so callers can persist it however they like, and it is
/// immutable for the duration of a job.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RestoreError, Result};

/// Default tile edge in pixels
pub const DEFAULT_TILE_SIZE: u32 = 512;
/// Default overlap between neighbouring tiles in pixels
pub const DEFAULT_OVERLAP: u32 = 16;
/// Default strength when the model accepts one
pub const DEFAULT_GLOBAL_STRENGTH: f32 = 50.0;

/// Settings for the adaptive strength search
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct BrisqueSettings {
    /// Distance between coarse candidates (strength units)
    pub coarse_step: u32,

    /// Distance between fine candidates (strength units)
    pub fine_step: u32,

    /// Half-width of the fine window around the best coarse candidate
    pub fine_range: u32,

    /// Candidates whose output width drops below this fraction of the
    /// input width are excluded
    pub min_width_ratio: f32,

    /// Weight of the inverted, normalized BRISQUE score
    pub brisque_weight: f32,

    /// Weight of the sharpness proxy
    pub sharpness_weight: f32,
}

impl Default for BrisqueSettings {
    fn default() -> Self {
        Self {
            coarse_step: 20,
            fine_step: 5,
            fine_range: 30,
            min_width_ratio: 0.5,
            brisque_weight: 0.7,
            sharpness_weight: 0.3,
        }
    }
}

impl BrisqueSettings {
    pub fn validate(&self) -> Result<()> {
        if self.coarse_step == 0 || self.fine_step == 0 {
            return Err(RestoreError::Config("search steps must be greater than zero".into()));
        }
        if !(0.0..=1.0).contains(&self.min_width_ratio) {
            return Err(RestoreError::Config(format!(
                "min width ratio {} is outside [0, 1]",
                self.min_width_ratio
            )));
        }
        for (name, weight) in [
            ("brisque weight", self.brisque_weight),
            ("sharpness weight", self.sharpness_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(RestoreError::Config(format!("{} must be a non-negative number", name)));
            }
        }
        Ok(())
    }
}

/// Static description of the restoration model handed to the engine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ModelParams {
    /// Model identifier, also the key for timing statistics
    pub name: String,

    /// Whether the model takes a strength input
    pub supports_strength: bool,

    /// Tiles are padded so each side is a multiple of this
    pub pad_multiple: u32,

    /// Smallest spatial size the model accepts
    pub min_size: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            supports_strength: false,
            pad_multiple: 8,
            min_size: 0,
        }
    }
}

impl ModelParams {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style toggle for strength support
    pub fn with_strength(mut self, supported: bool) -> Self {
        self.supports_strength = supported;
        self
    }
}

/// Files needed by the no-reference quality scorer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QualityModelPaths {
    pub model: PathBuf,
    pub range: PathBuf,
}

/// All parameters of a restoration job
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    pub model: ModelParams,

    /// Tile edge length in pixels
    pub tile_size: u32,

    /// Overlap between neighbouring tiles; must be smaller than `tile_size`
    pub overlap: u32,

    /// Strength used when no search runs, or when the search fails (0-100)
    pub global_strength: f32,

    /// Worker threads; `None` uses the available parallelism
    pub threads: Option<usize>,

    /// Run the coarse/fine strength search per image
    pub adaptive_strength: bool,

    /// Black border added around each image before tiling, removed afterwards
    pub border: u32,

    pub brisque: BrisqueSettings,

    /// Model files for the quality scorer; the search is skipped without them
    pub quality_model: Option<QualityModelPaths>,

    /// Where scoring candidates are written; `None` uses the user cache dir
    pub scratch_dir: Option<PathBuf>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            model: ModelParams::default(),
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_OVERLAP,
            global_strength: DEFAULT_GLOBAL_STRENGTH,
            threads: None,
            adaptive_strength: false,
            border: 0,
            brisque: BrisqueSettings::default(),
            quality_model: None,
            scratch_dir: None,
        }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject configurations that cannot produce a valid tiling or search
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(RestoreError::Geometry("tile size must be greater than zero".into()));
        }
        if self.overlap >= self.tile_size {
            return Err(RestoreError::Geometry(format!(
                "overlap {} must be smaller than tile size {}",
                self.overlap, self.tile_size
            )));
        }
        if !(0.0..=100.0).contains(&self.global_strength) {
            return Err(RestoreError::Config(format!(
                "global strength {} is outside [0, 100]",
                self.global_strength
            )));
        }
        if self.threads == Some(0) {
            return Err(RestoreError::Config("thread count must be at least 1".into()));
        }
        if self.model.pad_multiple == 0 {
            return Err(RestoreError::Config("pad multiple must be at least 1".into()));
        }
        self.brisque.validate()
    }

    /// Number of workers to use for chunk processing
    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Scratch directory for scoring candidates
    ///
    /// Defaults to ~/.cache/chunked-restore/scoring on Linux
    pub fn scratch_dir(&self) -> PathBuf {
        if let Some(dir) = &self.scratch_dir {
            return dir.clone();
        }
        let mut path = dirs::cache_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);
        path.push("chunked-restore");
        path.push("scoring");
        path
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON string; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = JobConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tile_size, 512);
        assert_eq!(config.overlap, 16);
        assert_eq!(config.brisque.coarse_step, 20);
        assert_eq!(config.brisque.fine_step, 5);
        assert_eq!(config.brisque.fine_range, 30);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_tile() {
        let mut config = JobConfig::default();
        config.overlap = config.tile_size;
        assert!(matches!(config.validate(), Err(RestoreError::Geometry(_))));

        config.tile_size = 0;
        config.overlap = 0;
        assert!(matches!(config.validate(), Err(RestoreError::Geometry(_))));
    }

    #[test]
    fn test_invalid_search_settings() {
        let mut config = JobConfig::default();
        config.brisque.fine_step = 0;
        assert!(matches!(config.validate(), Err(RestoreError::Config(_))));

        let mut config = JobConfig::default();
        config.brisque.min_width_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = JobConfig::default();
        config.global_strength = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = JobConfig::from_json(r#"{ "tile_size": 256, "brisque": { "fine_step": 2 } }"#).unwrap();
        assert_eq!(config.tile_size, 256);
        assert_eq!(config.overlap, DEFAULT_OVERLAP);
        assert_eq!(config.brisque.fine_step, 2);
        assert_eq!(config.brisque.coarse_step, 20);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("job.json");

        let mut config = JobConfig::default();
        config.model = ModelParams::named("scunet_color").with_strength(true);
        config.adaptive_strength = true;
        config.threads = Some(2);
        config.save(&path).unwrap();

        let loaded = JobConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.worker_threads(), 2);
    }

    #[test]
    fn test_scratch_dir_override() {
        let mut config = JobConfig::default();
        config.scratch_dir = Some(PathBuf::from("/tmp/scoring-test"));
        assert_eq!(config.scratch_dir(), PathBuf::from("/tmp/scoring-test"));
    }
}
