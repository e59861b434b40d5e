/// Restoration orchestrator
///
/// Runs a [`RestorationJob`] end to end. Images are processed one after
/// the other in the job's processing order; the tiles of one image are
/// restored in parallel on a worker pool sized by the job config.
///
/// Flow per image:
/// 1. optional black border, then tiling
/// 2. strength selection (adaptive search on the central tile, or the
///    global strength)
/// 3. one pool job per tile: pad, infer, reconcile orientation, crop
/// 4. completions arrive over a channel; the coordinating thread records
///    timings and reports progress in completion order
/// 5. stitch, strip the border, hand the result to the sink
///
/// Any engine failure stops the job and the image is discarded, never
/// partially stitched.

use image::RgbaImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::engine::{self, EngineError, InferenceEngine, QualityScorer};
use super::search::StrengthSearch;
use super::tiling::{plan_tiles, TileGrid};
use super::timing::{format_remaining, RunMode, TimeEstimator};
use crate::error::{RestoreError, Result};
use crate::state::config::JobConfig;
use crate::state::data::{Image, RestorationJob, TimingSample};
use crate::state::progress::{JobStatus, ProcessingState, CANCELLED_MESSAGE};

/// Receives job events. Calls come from the thread running the job, in
/// chunk-completion order.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, _message: &str) {}
    /// An image finished; `index` is its position in submission order
    fn on_complete(&self, _index: usize, _image: &Image) {}
    fn on_error(&self, _message: &str) {}
}

/// Ignore all events
impl ProgressSink for () {}

/// One restored image
#[derive(Debug, Clone)]
pub struct RestoredImage {
    /// Index in submission order
    pub index: usize,
    pub image: Image,
    /// Strength the tiles were restored with
    pub strength: f32,
}

/// Result of a successful job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Restored images in processing order
    pub images: Vec<RestoredImage>,
    pub elapsed: Duration,
}

/// Snapshot of a job for polling UIs
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub status: JobStatus,
    pub percent: u8,
    pub status_line: String,
    /// Images not yet completed
    pub queued: usize,
    /// Estimated time left; `None` when unknown or the job is over
    pub eta: Option<Duration>,
    pub eta_text: Option<String>,
}

enum ChunkEvent {
    Done {
        chunk: usize,
        pixels: RgbaImage,
        elapsed: Duration,
    },
    Failed {
        chunk: usize,
        error: EngineError,
    },
    Skipped,
}

/// Drives restoration jobs against an inference engine
pub struct Restorer {
    engine: Arc<dyn InferenceEngine>,
    scorer: Option<Arc<dyn QualityScorer>>,
    estimator: Arc<TimeEstimator>,
}

impl Restorer {
    pub fn new(engine: Arc<dyn InferenceEngine>, estimator: Arc<TimeEstimator>) -> Self {
        Self {
            engine,
            scorer: None,
            estimator,
        }
    }

    /// Enable adaptive strength search with this quality scorer
    pub fn with_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn estimator(&self) -> &Arc<TimeEstimator> {
        &self.estimator
    }

    fn grid_for(config: &JobConfig, image: &Image) -> Result<TileGrid> {
        let border = config.border;
        plan_tiles(
            image.width() + 2 * border,
            image.height() + 2 * border,
            config.tile_size,
            config.overlap,
        )
    }

    /// Validate a job and create its progress state.
    ///
    /// Geometry and config problems are reported here, before any work.
    pub fn prepare(job: &RestorationJob) -> Result<Arc<ProcessingState>> {
        job.validate()?;
        let chunk_counts = job
            .images
            .iter()
            .map(|image| Self::grid_for(&job.config, image).map(|grid| grid.len()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(ProcessingState::new(chunk_counts)))
    }

    /// Run a job to completion on the calling thread.
    ///
    /// `state` must come from [`Restorer::prepare`] for the same job.
    pub fn run(
        &self,
        job: &RestorationJob,
        state: &ProcessingState,
        sink: &dyn ProgressSink,
    ) -> Result<JobOutcome> {
        let result = self.run_inner(job, state, sink);
        if let Err(e) = &result {
            let (message, cancelled) = if e.is_cancelled() {
                (CANCELLED_MESSAGE.to_string(), true)
            } else {
                (e.to_string(), false)
            };
            tracing::warn!("Job failed: {}", message);
            state.fail(message.clone(), cancelled);
            sink.on_error(&message);
        }
        result
    }

    /// Run a job on tokio's blocking pool
    pub async fn run_async(
        self: Arc<Self>,
        job: RestorationJob,
        state: Arc<ProcessingState>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<JobOutcome> {
        tokio::task::spawn_blocking(move || self.run(&job, &state, sink.as_ref())).await?
    }

    fn run_inner(
        &self,
        job: &RestorationJob,
        state: &ProcessingState,
        sink: &dyn ProgressSink,
    ) -> Result<JobOutcome> {
        job.validate()?;
        if state.total_images() != job.images.len() {
            return Err(RestoreError::Config(format!(
                "progress state tracks {} images, job has {}",
                state.total_images(),
                job.images.len()
            )));
        }

        let config = &job.config;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads())
            .thread_name(|i| format!("restore-worker-{}", i))
            .build()?;

        tracing::info!(
            "Starting job: {} images, model {}, {} workers",
            job.images.len(),
            config.model.name,
            pool.current_num_threads()
        );
        state.begin();
        sink.on_progress(&state.status_line());

        let started = Instant::now();
        let mut restored = Vec::with_capacity(job.images.len());
        for (position, &index) in job.order.iter().enumerate() {
            if state.is_cancel_requested() {
                return Err(RestoreError::Cancelled);
            }
            let image = &job.images[index];
            state.begin_image(position, index);

            let result = self.restore_image(&pool, config, state, sink, image, index)?;
            sink.on_complete(index, &result.image);
            restored.push(result);
        }

        tracing::info!("Job finished in {:.1}s", started.elapsed().as_secs_f32());
        Ok(JobOutcome {
            images: restored,
            elapsed: started.elapsed(),
        })
    }

    fn restore_image(
        &self,
        pool: &rayon::ThreadPool,
        config: &JobConfig,
        state: &ProcessingState,
        sink: &dyn ProgressSink,
        image: &Image,
        index: usize,
    ) -> Result<RestoredImage> {
        let source = engine::add_border(&image.pixels, config.border);
        let grid = Self::grid_for(config, image)?;
        tracing::info!(
            "Image {} '{}': {}x{} in {} tiles",
            index,
            image.name,
            image.width(),
            image.height(),
            grid.len()
        );

        let strength = self.select_strength(config, state, sink, &grid, &source, index)?;
        let tiles = self.restore_tiles(pool, config, state, sink, &grid, &source, strength, index)?;
        let stitched = grid.stitch(&tiles)?;
        let pixels = engine::remove_border(stitched, config.border);

        Ok(RestoredImage {
            index,
            image: Image::new(image.name.clone(), pixels, image.has_alpha),
            strength,
        })
    }

    /// Adaptive strength when enabled and possible, otherwise the global one.
    /// Scoring failures fall back to the global strength.
    fn select_strength(
        &self,
        config: &JobConfig,
        state: &ProcessingState,
        sink: &dyn ProgressSink,
        grid: &TileGrid,
        source: &RgbaImage,
        index: usize,
    ) -> Result<f32> {
        let global = config.global_strength;
        if !config.adaptive_strength || !config.model.supports_strength {
            return Ok(global);
        }
        let (Some(scorer), Some(paths)) = (&self.scorer, &config.quality_model) else {
            tracing::debug!("No quality scorer configured, using strength {}", global);
            return Ok(global);
        };
        let Some(tile) = grid.representative() else {
            return Ok(global);
        };

        sink.on_progress(&format!(
            "Finding best strength for image {} of {}",
            state.current_image(),
            state.total_images()
        ));
        let sample = grid.extract(source, tile);
        let mut search = StrengthSearch::new(
            self.engine.as_ref(),
            scorer.as_ref(),
            &config.model,
            &config.brisque,
            paths,
            config.scratch_dir(),
        );
        match search.run(&sample, index, tile.index) {
            Ok(outcome) => Ok(outcome.strength as f32),
            Err(RestoreError::Scoring(e)) => {
                tracing::warn!("Strength search failed ({}), using global strength {}", e, global);
                Ok(global)
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn restore_tiles(
        &self,
        pool: &rayon::ThreadPool,
        config: &JobConfig,
        state: &ProcessingState,
        sink: &dyn ProgressSink,
        grid: &TileGrid,
        source: &RgbaImage,
        strength: f32,
        index: usize,
    ) -> Result<Vec<RgbaImage>> {
        let inference = self.engine.as_ref();
        let model = &config.model;
        let abort = AtomicBool::new(false);
        let abort = &abort;

        let (mode, unit_area) = if grid.is_chunked() {
            (RunMode::Chunked, config.tile_size as u64 * config.tile_size as u64)
        } else {
            (RunMode::Single, grid.image_width as u64 * grid.image_height as u64)
        };

        let mut slots: Vec<Option<RgbaImage>> = vec![None; grid.len()];
        let mut failure: Option<RestoreError> = None;

        pool.in_place_scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for tile in &grid.tiles {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    if state.is_cancel_requested() || abort.load(Ordering::Acquire) {
                        let _ = tx.send(ChunkEvent::Skipped);
                        return;
                    }
                    state.chunk_started(tile.index);
                    let started = Instant::now();
                    let input = grid.extract(source, tile);
                    let event = match engine::run_tile(inference, &input, strength, model) {
                        Ok(pixels) => {
                            state.complete_chunk(index);
                            ChunkEvent::Done {
                                chunk: tile.index,
                                pixels,
                                elapsed: started.elapsed(),
                            }
                        }
                        Err(error) => {
                            abort.store(true, Ordering::Release);
                            ChunkEvent::Failed {
                                chunk: tile.index,
                                error,
                            }
                        }
                    };
                    let _ = tx.send(event);
                });
            }
            drop(tx);

            for event in rx {
                match event {
                    ChunkEvent::Done {
                        chunk,
                        pixels,
                        elapsed,
                    } => {
                        tracing::debug!("Image {} chunk {} done in {:?}", index, chunk, elapsed);
                        slots[chunk] = Some(pixels);
                        let sample = TimingSample {
                            model: model.name.clone(),
                            mode,
                            area: unit_area,
                            duration: elapsed,
                        };
                        if let Err(e) = self.estimator.record(&sample) {
                            tracing::warn!("Failed to persist timing sample: {}", e);
                        }
                        sink.on_progress(&state.status_line());
                    }
                    ChunkEvent::Failed { chunk, error } => {
                        tracing::error!("Image {} chunk {} failed: {}", index, chunk, error);
                        if failure.is_none() {
                            failure = Some(RestoreError::Engine {
                                image: index,
                                chunk,
                                source: error,
                            });
                        }
                    }
                    ChunkEvent::Skipped => {}
                }
            }
        });
        state.chunks_idle();

        if let Some(e) = failure {
            return Err(e);
        }
        // Only cancellation leaves a slot empty
        slots
            .into_iter()
            .map(|slot| slot.ok_or(RestoreError::Cancelled))
            .collect()
    }

    /// Status, percentage and ETA of a job in one value
    pub fn progress_report(&self, job: &RestorationJob, state: &ProcessingState) -> ProgressReport {
        let status = state.status();
        let eta = if status.is_terminal() {
            None
        } else {
            self.estimate_remaining(job, state)
        };
        ProgressReport {
            percent: state.percent(),
            status_line: state.status_line(),
            queued: state.queued_images(),
            eta_text: eta.map(format_remaining),
            eta,
            status,
        }
    }

    fn estimate_remaining(&self, job: &RestorationJob, state: &ProcessingState) -> Option<Duration> {
        let config = &job.config;
        let model = &config.model.name;
        let in_flight = state.in_flight_elapsed();

        if state.is_chunked() {
            let tile_area = config.tile_size as u64 * config.tile_size as u64;
            return self.estimator.remaining(
                model,
                RunMode::Chunked,
                tile_area,
                state.remaining_chunks(),
                in_flight,
            );
        }

        // Unchunked: one unit per image, each scaled by its own area
        let current = state.current_image_index();
        let mut total = Duration::ZERO;
        for &index in &job.order {
            let (done, chunks) = state.image_chunks(index);
            if done >= chunks {
                continue;
            }
            let border = 2 * config.border as u64;
            let image = &job.images[index];
            let area = (image.width() as u64 + border) * (image.height() as u64 + border);
            let per_unit = self.estimator.per_unit_estimate(model, RunMode::Single, area)?;
            total += match in_flight {
                Some(elapsed) if index == current && state.current_image() > 0 => {
                    per_unit.saturating_sub(elapsed)
                }
                _ => per_unit,
            };
        }
        Some(total)
    }
}

impl std::fmt::Debug for Restorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Restorer")
            .field("scorer", &self.scorer.is_some())
            .field("estimator", &self.estimator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::config::{ModelParams, QualityModelPaths};
    use crate::state::timings::TimingStore;
    use image::{imageops, Rgba};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        progress: Mutex<Vec<String>>,
        completed: Mutex<Vec<usize>>,
        errors: Mutex<Vec<String>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, message: &str) {
            self.progress.lock().unwrap().push(message.to_string());
        }
        fn on_complete(&self, index: usize, _image: &Image) {
            self.completed.lock().unwrap().push(index);
        }
        fn on_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    fn estimator() -> Arc<TimeEstimator> {
        Arc::new(TimeEstimator::new(Arc::new(TimingStore::in_memory().unwrap())))
    }

    fn identity(input: &RgbaImage, _: f32, _: &ModelParams) -> std::result::Result<RgbaImage, EngineError> {
        Ok(input.clone())
    }

    fn pattern(name: &str, w: u32, h: u32) -> Image {
        let pixels = RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x % 251) as u8, (y % 241) as u8, ((x * 3 + y * 7) % 256) as u8, 255])
        });
        Image::new(name, pixels, false)
    }

    fn config(threads: usize) -> JobConfig {
        JobConfig {
            model: ModelParams::named("fbcnn_color"),
            threads: Some(threads),
            ..JobConfig::default()
        }
    }

    #[test]
    fn test_two_image_scenario() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let engine = move |input: &RgbaImage, s: f32, p: &ModelParams| {
            counter.fetch_add(1, Ordering::SeqCst);
            identity(input, s, p)
        };
        let restorer = Restorer::new(Arc::new(engine), estimator());
        let job = RestorationJob::new(
            vec![pattern("big.png", 1024, 1024), pattern("small.png", 300, 300)],
            config(4),
        );

        let state = Restorer::prepare(&job).unwrap();
        assert_eq!(state.total_chunks(), 5);
        assert_eq!(state.image_chunks(0), (0, 4));
        assert_eq!(state.image_chunks(1), (0, 1));
        assert_eq!(state.status(), JobStatus::Idle);

        let sink = RecordingSink::default();
        let outcome = restorer.run(&job, &state, &sink).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(state.status(), JobStatus::Success);
        assert_eq!(state.percent(), 100);
        assert_eq!(state.completed_chunks(), 5);
        assert!(state.is_completed());

        assert_eq!(outcome.images.len(), 2);
        assert_eq!(outcome.images[0].image.pixels, job.images[0].pixels);
        assert_eq!(outcome.images[1].image.pixels, job.images[1].pixels);
        assert_eq!(outcome.images[0].strength, 50.0);
        assert_eq!(*sink.completed.lock().unwrap(), vec![0, 1]);
        assert!(sink.errors.lock().unwrap().is_empty());

        // One report per chunk of the big image, never going backwards
        let chunk_counts: Vec<usize> = sink
            .progress
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.strip_prefix("Processing image 1 of 2 (chunk "))
            .filter_map(|rest| rest.split(' ').next()?.parse().ok())
            .collect();
        assert_eq!(chunk_counts.len(), 4);
        assert!(chunk_counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(chunk_counts.last(), Some(&4));

        // Both run modes were learned
        assert!(restorer.estimator().average("fbcnn_color", RunMode::Chunked).is_some());
        assert!(restorer.estimator().average("fbcnn_color", RunMode::Single).is_some());
    }

    #[test]
    fn test_processing_order_is_respected() {
        let restorer = Restorer::new(Arc::new(identity), estimator());
        let job = RestorationJob::new(
            vec![pattern("a", 40, 40), pattern("b", 50, 30), pattern("c", 20, 60)],
            config(2),
        )
        .with_order(vec![2, 0, 1]);

        let state = Restorer::prepare(&job).unwrap();
        let sink = RecordingSink::default();
        let outcome = restorer.run(&job, &state, &sink).unwrap();

        assert_eq!(*sink.completed.lock().unwrap(), vec![2, 0, 1]);
        let indices: Vec<usize> = outcome.images.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![2, 0, 1]);
        assert_eq!(outcome.images[0].image.name, "c");
        assert_eq!(state.status_line(), "Completed 3 images");
    }

    #[test]
    fn test_engine_failure_discards_image() {
        let engine = |input: &RgbaImage, _: f32, _: &ModelParams| -> std::result::Result<RgbaImage, EngineError> {
            if input.width() > 400 {
                Err(EngineError::new("out of memory"))
            } else {
                Ok(input.clone())
            }
        };
        let restorer = Restorer::new(Arc::new(engine), estimator());
        let job = RestorationJob::new(
            vec![pattern("big", 1024, 600), pattern("small", 100, 100)],
            config(2),
        );

        let state = Restorer::prepare(&job).unwrap();
        let sink = RecordingSink::default();
        let err = restorer.run(&job, &state, &sink).unwrap_err();

        assert!(matches!(err, RestoreError::Engine { image: 0, .. }));
        assert!(sink.completed.lock().unwrap().is_empty());
        assert_eq!(sink.errors.lock().unwrap().len(), 1);
        match state.status() {
            JobStatus::Error { message, cancelled } => {
                assert!(!cancelled);
                assert!(message.contains("out of memory"));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_cancel_before_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let engine = move |input: &RgbaImage, s: f32, p: &ModelParams| {
            counter.fetch_add(1, Ordering::SeqCst);
            identity(input, s, p)
        };
        let restorer = Restorer::new(Arc::new(engine), estimator());
        let job = RestorationJob::new(vec![pattern("a", 64, 64)], config(1));

        let state = Restorer::prepare(&job).unwrap();
        state.request_cancel();
        let err = restorer.run(&job, &state, &()).unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            state.status(),
            JobStatus::Error {
                message: CANCELLED_MESSAGE.to_string(),
                cancelled: true
            }
        );
    }

    #[test]
    fn test_cancel_while_chunks_run() {
        let job = RestorationJob::new(vec![pattern("big", 1024, 1024)], config(1));
        let state = Restorer::prepare(&job).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cancel = state.clone();
        let engine = move |input: &RgbaImage, s: f32, p: &ModelParams| {
            counter.fetch_add(1, Ordering::SeqCst);
            cancel.request_cancel();
            identity(input, s, p)
        };
        let restorer = Restorer::new(Arc::new(engine), estimator());
        let sink = RecordingSink::default();
        let err = restorer.run(&job, &state, &sink).unwrap_err();

        // The running chunk finishes, the other three never start
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.completed_chunks(), 1);
        assert!(sink.completed.lock().unwrap().is_empty());
        assert_eq!(*sink.errors.lock().unwrap(), vec![CANCELLED_MESSAGE.to_string()]);
        assert_eq!(
            state.status(),
            JobStatus::Error {
                message: CANCELLED_MESSAGE.to_string(),
                cancelled: true
            }
        );
    }

    /// Cancels the job as soon as the first image completes
    struct CancelAfterFirst {
        state: Arc<ProcessingState>,
        completed: AtomicUsize,
    }

    impl ProgressSink for CancelAfterFirst {
        fn on_complete(&self, _index: usize, _image: &Image) {
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.state.request_cancel();
        }
    }

    #[test]
    fn test_cancel_between_images() {
        let restorer = Restorer::new(Arc::new(identity), estimator());
        let job = RestorationJob::new(vec![pattern("a", 64, 64), pattern("b", 64, 64)], config(2));
        let state = Restorer::prepare(&job).unwrap();
        let sink = CancelAfterFirst {
            state: state.clone(),
            completed: AtomicUsize::new(0),
        };

        let err = restorer.run(&job, &state, &sink).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(sink.completed.load(Ordering::SeqCst), 1);
        assert!(matches!(state.status(), JobStatus::Error { cancelled: true, .. }));
        assert_eq!(state.percent(), 50);
    }

    #[test]
    fn test_invalid_geometry_rejected_up_front() {
        let mut cfg = config(1);
        cfg.overlap = cfg.tile_size;
        let job = RestorationJob::new(vec![pattern("a", 64, 64)], cfg);
        assert!(matches!(Restorer::prepare(&job), Err(RestoreError::Geometry(_))));
    }

    #[test]
    fn test_alpha_border_and_rotation_are_handled() {
        // Engine returns the tile upside down with flattened alpha
        let engine = |input: &RgbaImage, _: f32, _: &ModelParams| -> std::result::Result<RgbaImage, EngineError> {
            let mut out = imageops::rotate180(input);
            for p in out.pixels_mut() {
                p[3] = 255;
            }
            Ok(out)
        };
        let restorer = Restorer::new(Arc::new(engine), estimator());

        let pixels = RgbaImage::from_fn(150, 90, |x, y| {
            Rgba([(x % 256) as u8, (y * 2 % 256) as u8, 7, ((x + y) % 200) as u8 + 50])
        });
        let image = Image::new("alpha.png", pixels.clone(), true);
        let mut cfg = config(3);
        cfg.tile_size = 64;
        cfg.overlap = 8;
        cfg.border = 4;
        let job = RestorationJob::new(vec![image], cfg);

        let state = Restorer::prepare(&job).unwrap();
        let outcome = restorer.run(&job, &state, &()).unwrap();
        let restored = &outcome.images[0].image;
        assert!(restored.has_alpha);
        assert_eq!(restored.pixels, pixels);
    }

    fn strength_engine(input: &RgbaImage, strength: f32, _: &ModelParams) -> std::result::Result<RgbaImage, EngineError> {
        Ok(RgbaImage::from_pixel(
            input.width(),
            input.height(),
            Rgba([strength as u8, 0, 0, 255]),
        ))
    }

    /// BRISQUE that is best at strength 50
    fn peaked_scorer(path: &Path, _: &Path, _: &Path) -> f32 {
        match image::open(path) {
            Ok(img) => (img.to_rgba8().get_pixel(0, 0)[0] as f32 - 50.0).abs(),
            Err(_) => -1.0,
        }
    }

    fn adaptive_config(scratch: &Path) -> JobConfig {
        let mut cfg = config(2);
        cfg.model = ModelParams::named("scunet_color").with_strength(true);
        cfg.adaptive_strength = true;
        cfg.global_strength = 30.0;
        cfg.tile_size = 64;
        cfg.overlap = 8;
        cfg.scratch_dir = Some(scratch.to_path_buf());
        cfg.quality_model = Some(QualityModelPaths {
            model: PathBuf::from("brisque_model_live.yml"),
            range: PathBuf::from("brisque_range_live.yml"),
        });
        cfg
    }

    #[test]
    fn test_adaptive_strength_applied_to_all_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let restorer = Restorer::new(Arc::new(strength_engine), estimator()).with_scorer(Arc::new(peaked_scorer));
        let job = RestorationJob::new(vec![pattern("a", 150, 150)], adaptive_config(dir.path()));

        let state = Restorer::prepare(&job).unwrap();
        let outcome = restorer.run(&job, &state, &()).unwrap();
        let restored = &outcome.images[0];
        assert_eq!(restored.strength, 50.0);
        assert!(restored.image.pixels.pixels().all(|p| p[0] == 50));
        assert_eq!(state.status(), JobStatus::Success);
    }

    #[test]
    fn test_scoring_failure_falls_back_to_global_strength() {
        let dir = tempfile::tempdir().unwrap();
        let scorer = |_: &Path, _: &Path, _: &Path| -2.0f32;
        let restorer = Restorer::new(Arc::new(strength_engine), estimator()).with_scorer(Arc::new(scorer));
        let job = RestorationJob::new(vec![pattern("a", 150, 150)], adaptive_config(dir.path()));

        let state = Restorer::prepare(&job).unwrap();
        let outcome = restorer.run(&job, &state, &()).unwrap();
        let restored = &outcome.images[0];
        assert_eq!(restored.strength, 30.0);
        assert!(restored.image.pixels.pixels().all(|p| p[0] == 30));
        assert_eq!(state.status(), JobStatus::Success);
    }

    #[test]
    fn test_progress_report() {
        let restorer = Restorer::new(Arc::new(identity), estimator());
        let job = RestorationJob::new(vec![pattern("a", 1024, 1024)], config(2));
        let state = Restorer::prepare(&job).unwrap();

        // Nothing learned yet
        let report = restorer.progress_report(&job, &state);
        assert_eq!(report.status, JobStatus::Idle);
        assert_eq!(report.status_line, "Idle");
        assert_eq!(report.queued, 1);
        assert_eq!(report.eta, None);

        restorer
            .estimator()
            .record(&TimingSample {
                model: "fbcnn_color".into(),
                mode: RunMode::Chunked,
                area: 512 * 512,
                duration: Duration::from_secs(2),
            })
            .unwrap();
        let report = restorer.progress_report(&job, &state);
        assert_eq!(report.eta, Some(Duration::from_secs(8)));
        assert_eq!(report.eta_text.as_deref(), Some("8s remaining"));

        restorer.run(&job, &state, &()).unwrap();
        let report = restorer.progress_report(&job, &state);
        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.percent, 100);
        assert_eq!(report.queued, 0);
        assert_eq!(report.eta, None);
    }

    #[tokio::test]
    async fn test_run_async() {
        let restorer = Arc::new(Restorer::new(Arc::new(identity), estimator()));
        let job = RestorationJob::new(vec![pattern("a", 700, 300)], config(2));
        let state = Restorer::prepare(&job).unwrap();
        let sink = Arc::new(RecordingSink::default());

        let outcome = restorer
            .run_async(job.clone(), state.clone(), sink.clone())
            .await
            .unwrap();
        assert_eq!(outcome.images[0].image.pixels, job.images[0].pixels);
        assert_eq!(state.status(), JobStatus::Success);
        assert_eq!(*sink.completed.lock().unwrap(), vec![0]);
    }
}
