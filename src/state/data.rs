/// Shared data structures for a restoration job
///
/// These structs represent the data model that flows between
/// the caller, the orchestrator and the worker pool.

use image::{DynamicImage, RgbaImage};
use std::path::Path;
use std::time::Duration;

use super::config::JobConfig;
use crate::error::{RestoreError, Result};

/// A source image owned by a job
///
/// Pixels are kept as RGBA8 whatever the source format was; `has_alpha`
/// remembers whether the alpha channel carries real data.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Display name (usually the file name)
    pub name: String,
    /// RGBA pixel buffer
    pub pixels: RgbaImage,
    /// Whether the source had an alpha channel
    pub has_alpha: bool,
}

impl Image {
    pub fn new(name: impl Into<String>, pixels: RgbaImage, has_alpha: bool) -> Self {
        Self {
            name: name.into(),
            pixels,
            has_alpha,
        }
    }

    /// Wrap a decoded image, detecting alpha from its color type
    pub fn from_dynamic(name: impl Into<String>, img: DynamicImage) -> Self {
        let has_alpha = img.color().has_alpha();
        Self::new(name, img.to_rgba8(), has_alpha)
    }

    /// Decode an image file from disk
    pub fn open(path: &Path) -> Result<Self> {
        let img = image::open(path)?;
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        Ok(Self::from_dynamic(name, img))
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// One user request over 1..N images
#[derive(Debug, Clone)]
pub struct RestorationJob {
    pub images: Vec<Image>,
    /// Indices into `images`, in the order they are processed
    pub order: Vec<usize>,
    pub config: JobConfig,
}

impl RestorationJob {
    /// Create a job that processes images in submission order
    pub fn new(images: Vec<Image>, config: JobConfig) -> Self {
        let order = (0..images.len()).collect();
        Self { images, order, config }
    }

    /// Override the processing order
    pub fn with_order(mut self, order: Vec<usize>) -> Self {
        self.order = order;
        self
    }

    /// Check the job is runnable: non-empty, valid order, valid config
    pub fn validate(&self) -> Result<()> {
        if self.images.is_empty() {
            return Err(RestoreError::Config("job has no images".into()));
        }

        let mut seen = vec![false; self.images.len()];
        if self.order.len() != self.images.len() {
            return Err(RestoreError::Config(format!(
                "processing order has {} entries for {} images",
                self.order.len(),
                self.images.len()
            )));
        }
        for &idx in &self.order {
            match seen.get_mut(idx) {
                Some(flag) if !*flag => *flag = true,
                Some(_) => {
                    return Err(RestoreError::Config(format!(
                        "image {} appears twice in processing order",
                        idx
                    )))
                }
                None => {
                    return Err(RestoreError::Config(format!(
                        "processing order references missing image {}",
                        idx
                    )))
                }
            }
        }

        if let Some(img) = self.images.iter().find(|img| img.width() == 0 || img.height() == 0) {
            return Err(RestoreError::Geometry(format!("image '{}' is empty", img.name)));
        }

        self.config.validate()
    }
}

/// Whether a timing sample came from a tiled or an unchunked run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    Chunked,
    Single,
}

impl RunMode {
    /// Key used in the timing database
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Chunked => "chunked",
            RunMode::Single => "single",
        }
    }
}

/// Measured duration of one unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSample {
    pub model: String,
    pub mode: RunMode,
    /// Pixel area the duration is attributed to (configured tile area, or image area)
    pub area: u64,
    pub duration: Duration,
}
