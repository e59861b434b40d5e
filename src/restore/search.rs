/// Adaptive strength search
///
/// Finds the model strength that gives the best looking output for one
/// representative tile. A coarse pass samples the whole 0-100 range, a fine
/// pass then refines around the best coarse candidate. Each candidate costs
/// one inference call; results are memoized by strength so the fine pass
/// never re-runs a strength the coarse pass already tried.
///
/// Candidate score (higher is better):
///
/// ```text
/// score = brisque_weight * (100 - brisque) / 100 + sharpness_weight * sharpness / 100
/// ```
///
/// BRISQUE is clamped to [0, 100] and sharpness is the normalized Sobel
/// proxy from [`estimate_sharpness`].

use image::RgbaImage;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::engine::{self, InferenceEngine, QualityScorer};
use crate::error::{RestoreError, Result, ScoringError};
use crate::state::config::{BrisqueSettings, ModelParams, QualityModelPaths};

/// Upper bound of the strength range
pub const MAX_STRENGTH: u32 = 100;

/// Distinguishes scratch files written by concurrent searches
static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outcome of evaluating one strength
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub strength: u32,
    /// Composite score; `None` when the candidate was excluded
    pub score: Option<f32>,
    /// Raw BRISQUE score reported by the scorer
    pub brisque: Option<f32>,
    pub sharpness: f32,
}

impl Candidate {
    fn excluded(strength: u32) -> Self {
        Self {
            strength,
            score: None,
            brisque: None,
            sharpness: 0.0,
        }
    }
}

/// Result of a completed search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub strength: u32,
    pub score: f32,
    /// Inference calls made
    pub evaluations: usize,
    /// Every candidate evaluated, ordered by strength
    pub candidates: Vec<Candidate>,
}

/// Sharpness proxy: RMS Sobel gradient of luminance, mapped to [0, 100)
/// as `100 * (1 - exp(-raw / 30))`
pub fn estimate_sharpness(image: &RgbaImage) -> f32 {
    let (w, h) = image.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let luma: Vec<f32> = image
        .pixels()
        .map(|p| p[0] as f32 * 0.299 + p[1] as f32 * 0.587 + p[2] as f32 * 0.114)
        .collect();
    let w = w as usize;
    let h = h as usize;
    let at = |x: usize, y: usize| luma[y * w + x];

    let mut sum = 0.0f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            // Paired differences cancel exactly on flat regions
            let gx = (at(x + 1, y - 1) - at(x - 1, y - 1))
                + 2.0 * (at(x + 1, y) - at(x - 1, y))
                + (at(x + 1, y + 1) - at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) - at(x - 1, y - 1))
                + 2.0 * (at(x, y + 1) - at(x, y - 1))
                + (at(x + 1, y + 1) - at(x + 1, y - 1));
            sum += (gx * gx + gy * gy) as f64;
        }
    }
    let samples = ((w - 2) * (h - 2)) as f64;
    let raw = (sum / samples).sqrt() as f32;
    100.0 * (1.0 - (-raw / 30.0).exp())
}

/// Coarse candidates: every `step` from 0, with the maximum always included
fn coarse_candidates(step: u32) -> Vec<u32> {
    let mut strengths: Vec<u32> = (0..=MAX_STRENGTH).step_by(step.max(1) as usize).collect();
    if strengths.last() != Some(&MAX_STRENGTH) {
        strengths.push(MAX_STRENGTH);
    }
    strengths
}

/// Fine candidates: `[center - range, center + range]` clamped to the
/// strength range, every `step`
fn fine_candidates(center: u32, range: u32, step: u32) -> Vec<u32> {
    let low = center.saturating_sub(range);
    let high = center.saturating_add(range).min(MAX_STRENGTH);
    (low..=high).step_by(step.max(1) as usize).collect()
}

/// Highest score wins; ties go to the lower strength
fn best_of(results: &BTreeMap<u32, Candidate>) -> Option<(u32, f32)> {
    let mut best: Option<(u32, f32)> = None;
    // BTreeMap iterates in ascending strength
    for (&strength, candidate) in results {
        if let Some(score) = candidate.score {
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((strength, score));
            }
        }
    }
    best
}

/// One strength search over a single tile
pub struct StrengthSearch<'a> {
    engine: &'a dyn InferenceEngine,
    scorer: &'a dyn QualityScorer,
    model: &'a ModelParams,
    settings: &'a BrisqueSettings,
    quality_model: &'a QualityModelPaths,
    scratch_dir: PathBuf,
    results: BTreeMap<u32, Candidate>,
}

impl<'a> StrengthSearch<'a> {
    pub fn new(
        engine: &'a dyn InferenceEngine,
        scorer: &'a dyn QualityScorer,
        model: &'a ModelParams,
        settings: &'a BrisqueSettings,
        quality_model: &'a QualityModelPaths,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            scorer,
            model,
            settings,
            quality_model,
            scratch_dir,
            results: BTreeMap::new(),
        }
    }

    /// Search the best strength for `tile`.
    ///
    /// `image` and `chunk` only label engine failures, which abort the
    /// search. Fails with [`ScoringError::NoScorableCandidate`] when every
    /// candidate was excluded.
    pub fn run(&mut self, tile: &RgbaImage, image: usize, chunk: usize) -> Result<SearchOutcome> {
        if let Err(e) = std::fs::create_dir_all(&self.scratch_dir) {
            tracing::warn!("Could not create scratch dir {}: {}", self.scratch_dir.display(), e);
        }

        for strength in coarse_candidates(self.settings.coarse_step) {
            self.evaluate(tile, strength, image, chunk)?;
        }
        let (coarse_best, coarse_score) =
            best_of(&self.results).ok_or(ScoringError::NoScorableCandidate)?;
        tracing::debug!("Coarse search best: strength {} (score {:.3})", coarse_best, coarse_score);

        for strength in fine_candidates(coarse_best, self.settings.fine_range, self.settings.fine_step) {
            self.evaluate(tile, strength, image, chunk)?;
        }
        let (strength, score) = best_of(&self.results).ok_or(ScoringError::NoScorableCandidate)?;

        tracing::info!(
            "Adaptive strength {} selected (score {:.3}, {} evaluations)",
            strength,
            score,
            self.results.len()
        );
        Ok(SearchOutcome {
            strength,
            score,
            evaluations: self.results.len(),
            candidates: self.results.values().cloned().collect(),
        })
    }

    /// Evaluate one strength unless it is already memoized
    fn evaluate(&mut self, tile: &RgbaImage, strength: u32, image: usize, chunk: usize) -> Result<()> {
        if self.results.contains_key(&strength) {
            return Ok(());
        }

        let padded = engine::pad_for_model(tile, self.model);
        let output = self
            .engine
            .restore_tile(&padded, strength as f32, self.model)
            .map_err(|source| RestoreError::Engine {
                image,
                chunk,
                source,
            })?;

        let candidate = self.score_output(tile, &padded, output, strength);
        match candidate.score {
            Some(score) => tracing::debug!("Strength {}: score {:.3}", strength, score),
            None => tracing::debug!("Strength {}: excluded", strength),
        }
        self.results.insert(strength, candidate);
        Ok(())
    }

    fn score_output(
        &self,
        tile: &RgbaImage,
        padded: &RgbaImage,
        output: RgbaImage,
        strength: u32,
    ) -> Candidate {
        let min_width = self.settings.min_width_ratio * padded.width() as f32;
        let width = upright_width(padded, &output);
        if (width as f32) < min_width {
            tracing::debug!(
                "Strength {}: output width {} below minimum {:.0}",
                strength,
                width,
                min_width
            );
            return Candidate::excluded(strength);
        }

        let restored = match engine::finish_tile(tile, padded, output) {
            Ok(restored) => restored,
            Err(e) => {
                tracing::warn!("Strength {}: unusable output: {}", strength, e);
                return Candidate::excluded(strength);
            }
        };
        let sharpness = estimate_sharpness(&restored);

        let brisque = match self.brisque(&restored) {
            Ok(brisque) => brisque,
            Err(e) => {
                tracing::warn!("Strength {}: {}", strength, e);
                return Candidate::excluded(strength);
            }
        };

        let inverted = (100.0 - brisque.clamp(0.0, 100.0)) / 100.0;
        let score = self.settings.brisque_weight * inverted
            + self.settings.sharpness_weight * sharpness / 100.0;
        Candidate {
            strength,
            score: Some(score),
            brisque: Some(brisque),
            sharpness,
        }
    }

    /// Write the candidate to the scratch dir and hand it to the scorer
    fn brisque(&self, restored: &RgbaImage) -> std::result::Result<f32, ScoringError> {
        let path = self.scratch_path();
        if let Err(e) = restored.save(&path) {
            tracing::warn!("Could not write scoring candidate {}: {}", path.display(), e);
            return Err(ScoringError::ImageUnreadable);
        }

        let raw = self
            .scorer
            .score(&path, &self.quality_model.model, &self.quality_model.range);
        remove_scratch(&path);
        ScoringError::classify(raw)
    }

    fn scratch_path(&self) -> PathBuf {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir
            .join(format!("candidate-{}-{}.png", std::process::id(), n))
    }
}

/// Output width once a quarter-turn by the engine is undone
fn upright_width(padded: &RgbaImage, output: &RgbaImage) -> u32 {
    let (pw, ph) = padded.dimensions();
    if pw != ph && output.dimensions() == (ph, pw) {
        output.height()
    } else {
        output.width()
    }
}

fn remove_scratch(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!("Could not remove {}: {}", path.display(), e);
    }
}
