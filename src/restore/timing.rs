/// Processing-time estimation
///
/// Durations are learned per model and run mode as an exponential moving
/// average (`new = 0.8 * old + 0.2 * sample`). Samples are normalized to a
/// 512x512 reference tile before folding in, so an average learned at one
/// tile size still predicts another. The running average is persisted in
/// the [`TimingStore`] after every sample and lazily loaded on first use.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::Result;
use crate::state::data::TimingSample;
use crate::state::timings::TimingStore;

pub use crate::state::data::RunMode;

/// Edge of the tile the stored averages refer to
pub const REFERENCE_TILE_SIZE: u32 = 512;

/// Weight of a new sample in the moving average
const SMOOTHING: f64 = 0.2;

/// In-session samples averaged for the preferred estimate
const RECENT_WINDOW: usize = 3;

#[derive(Debug, Default)]
struct ModelTimings {
    /// Normalized running average in milliseconds
    running: Option<f64>,
    /// Last few normalized samples of this session
    recent: VecDeque<f64>,
    persisted: Option<f64>,
    loaded: bool,
}

/// Learns and predicts per-unit processing time
pub struct TimeEstimator {
    store: Arc<TimingStore>,
    reference_area: u64,
    models: Mutex<HashMap<(String, RunMode), ModelTimings>>,
}

impl TimeEstimator {
    pub fn new(store: Arc<TimingStore>) -> Self {
        Self {
            store,
            reference_area: REFERENCE_TILE_SIZE as u64 * REFERENCE_TILE_SIZE as u64,
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Estimator backed by a timing database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let store = TimingStore::open(path)?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<TimingStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, RunMode), ModelTimings>> {
        self.models.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ratio of `area` to the reference tile area
    fn area_factor(&self, area: u64) -> f64 {
        if area == 0 {
            1.0
        } else {
            area as f64 / self.reference_area as f64
        }
    }

    fn entry<'a>(
        &self,
        models: &'a mut HashMap<(String, RunMode), ModelTimings>,
        model: &str,
        mode: RunMode,
    ) -> &'a mut ModelTimings {
        let timings = models.entry((model.to_string(), mode)).or_default();
        if !timings.loaded {
            timings.loaded = true;
            match self.store.load_average(model, mode) {
                Ok(persisted) => timings.persisted = persisted,
                Err(e) => tracing::warn!("Failed to load timing average for {}: {}", model, e),
            }
        }
        timings
    }

    /// Fold one measured unit of work into the model's average and persist it.
    ///
    /// The in-memory average is updated even when persisting fails.
    pub fn record(&self, sample: &TimingSample) -> rusqlite::Result<()> {
        let normalized = sample.duration.as_nanos() as f64 / 1e6 / self.area_factor(sample.area);

        let updated = {
            let mut models = self.lock();
            let timings = self.entry(&mut models, &sample.model, sample.mode);

            let updated = match timings.running.or(timings.persisted) {
                Some(old) => old * (1.0 - SMOOTHING) + normalized * SMOOTHING,
                None => normalized,
            };
            timings.running = Some(updated);
            timings.persisted = Some(updated);
            if timings.recent.len() == RECENT_WINDOW {
                timings.recent.pop_front();
            }
            timings.recent.push_back(normalized);
            updated
        };

        tracing::debug!(
            "Timing sample for {} ({}): {:.1} ms normalized, average {:.1} ms",
            sample.model,
            sample.mode.as_str(),
            normalized,
            updated
        );
        self.store.save_average(&sample.model, sample.mode, updated)
    }

    /// Normalized running average in milliseconds, falling back to the
    /// persisted value
    pub fn average(&self, model: &str, mode: RunMode) -> Option<f64> {
        let mut models = self.lock();
        let timings = self.entry(&mut models, model, mode);
        timings.running.or(timings.persisted)
    }

    /// Expected duration of one unit of work covering `area` pixels.
    ///
    /// Prefers the mean of the last few samples of this session, then the
    /// running average, then the persisted one. `None` means nothing is
    /// known about the model yet.
    pub fn per_unit_estimate(&self, model: &str, mode: RunMode, area: u64) -> Option<Duration> {
        let normalized = {
            let mut models = self.lock();
            let timings = self.entry(&mut models, model, mode);
            if timings.recent.is_empty() {
                timings.running.or(timings.persisted)?
            } else {
                timings.recent.iter().sum::<f64>() / timings.recent.len() as f64
            }
        };
        let ms = (normalized * self.area_factor(area)).max(0.0);
        Some(Duration::from_nanos((ms * 1e6).round() as u64))
    }

    /// Time left for `units_left` units of `area` pixels each.
    ///
    /// When one of them is already running for `in_flight`, only what is
    /// left of it is counted.
    pub fn remaining(
        &self,
        model: &str,
        mode: RunMode,
        area: u64,
        units_left: usize,
        in_flight: Option<Duration>,
    ) -> Option<Duration> {
        if units_left == 0 {
            return Some(Duration::ZERO);
        }
        let per_unit = self.per_unit_estimate(model, mode, area)?;
        let queued = per_unit.saturating_mul(u32::try_from(units_left - 1).unwrap_or(u32::MAX));
        let current = match in_flight {
            Some(elapsed) => per_unit.saturating_sub(elapsed),
            None => per_unit,
        };
        Some(current + queued)
    }

    /// Forget everything learned about a model, in memory and on disk
    pub fn reset(&self, model: &str) -> rusqlite::Result<()> {
        self.lock().retain(|(name, _), _| name != model);
        let removed = self.store.clear_model(model)?;
        tracing::info!("Cleared {} timing averages for {}", removed, model);
        Ok(())
    }
}

impl std::fmt::Debug for TimeEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeEstimator")
            .field("store", &self.store)
            .field("reference_area", &self.reference_area)
            .finish()
    }
}

/// Render a remaining time the way it is shown to users
pub fn format_remaining(remaining: Duration) -> String {
    if remaining < Duration::from_secs(1) {
        return String::from("Finishing up...");
    }
    let seconds = remaining.as_secs();
    if seconds < 60 {
        format!("{}s remaining", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s remaining", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m remaining", seconds / 3600, (seconds % 3600) / 60)
    }
}
