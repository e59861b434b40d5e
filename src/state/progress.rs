/// Per-job progress tracking
///
/// One `ProcessingState` exists per restoration job and is shared by `Arc`
/// between the orchestrator, the chunk workers and whoever polls for status.
/// Every field is an independent atomic: readers may see slightly skewed
/// values across fields, but never a torn one. Workers only ever increment
/// the counters of the image they are working on.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const PHASE_IDLE: u8 = 0;
const PHASE_LOADING: u8 = 1;
const PHASE_PROCESSING: u8 = 2;
const PHASE_SUCCESS: u8 = 3;
const PHASE_ERROR: u8 = 4;

/// Message used when a job ends because the user cancelled it
pub const CANCELLED_MESSAGE: &str = "Processing cancelled";

/// Externally visible job state
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Idle,
    Loading,
    /// Percentage of work units completed (0-100)
    Processing(u8),
    Success,
    Error { message: String, cancelled: bool },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error { .. })
    }
}

/// Shared atomic progress counters for one job
#[derive(Debug)]
pub struct ProcessingState {
    phase: AtomicU8,
    /// 1-based position of the current image in processing order (0 = not started)
    current_image: AtomicUsize,
    /// Index of the current image in submission order
    current_image_idx: AtomicUsize,
    total_images: AtomicUsize,
    /// One past the highest chunk index started for the current image
    active_chunk_end: AtomicUsize,
    chunks_per_image: Vec<AtomicUsize>,
    completed_per_image: Vec<AtomicUsize>,
    total_chunks: AtomicUsize,
    completed_chunks: AtomicUsize,
    completed_images: AtomicUsize,
    chunked: AtomicBool,
    completed: AtomicBool,
    cancel_requested: AtomicBool,
    error: OnceLock<(String, bool)>,
    started_at: Instant,
    /// Milliseconds since `started_at` + 1 of the latest chunk start (0 = none in flight)
    chunk_started_ms: AtomicU64,
}

impl ProcessingState {
    /// Create an idle state for a job whose images need `chunk_counts` chunks each
    pub fn new(chunk_counts: Vec<usize>) -> Self {
        let total: usize = chunk_counts.iter().sum();
        let chunked = chunk_counts.iter().any(|&c| c > 1);
        let total_images = chunk_counts.len();

        Self {
            phase: AtomicU8::new(PHASE_IDLE),
            current_image: AtomicUsize::new(0),
            current_image_idx: AtomicUsize::new(0),
            total_images: AtomicUsize::new(total_images),
            active_chunk_end: AtomicUsize::new(0),
            completed_per_image: chunk_counts.iter().map(|_| AtomicUsize::new(0)).collect(),
            chunks_per_image: chunk_counts.into_iter().map(AtomicUsize::new).collect(),
            total_chunks: AtomicUsize::new(total),
            completed_chunks: AtomicUsize::new(0),
            completed_images: AtomicUsize::new(0),
            chunked: AtomicBool::new(chunked),
            completed: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            error: OnceLock::new(),
            started_at: Instant::now(),
            chunk_started_ms: AtomicU64::new(0),
        }
    }

    // ========== Transitions ==========

    /// Idle -> Loading, on job submission
    pub fn begin(&self) {
        let _ = self
            .phase
            .compare_exchange(PHASE_IDLE, PHASE_LOADING, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Mark `image_idx` as the image being processed, `position` being its
    /// 0-based place in the processing order
    pub fn begin_image(&self, position: usize, image_idx: usize) {
        self.current_image.store(position + 1, Ordering::Release);
        self.current_image_idx.store(image_idx, Ordering::Release);
        self.active_chunk_end.store(0, Ordering::Release);
        self.chunk_started_ms.store(0, Ordering::Release);
    }

    /// A worker picked up a chunk. Loading -> Processing on the first one.
    pub fn chunk_started(&self, chunk_idx: usize) {
        let _ = self.phase.compare_exchange(
            PHASE_LOADING,
            PHASE_PROCESSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.active_chunk_end.fetch_max(chunk_idx + 1, Ordering::AcqRel);
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        self.chunk_started_ms.store(elapsed + 1, Ordering::Release);
    }

    /// A chunk of `image_idx` finished. Returns the image's new completed count.
    ///
    /// Completing the last chunk of the job moves the state to Success.
    pub fn complete_chunk(&self, image_idx: usize) -> usize {
        let (Some(done), Some(expected)) = (
            self.completed_per_image.get(image_idx),
            self.chunks_per_image.get(image_idx),
        ) else {
            return 0;
        };
        let expected = expected.load(Ordering::Acquire);

        // Saturate so a stray extra completion can never push past 100%
        let previous = match done.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < expected).then_some(n + 1)
        }) {
            Ok(previous) => previous,
            Err(current) => return current,
        };
        let now_done = previous + 1;

        if now_done == expected {
            self.completed_images.fetch_add(1, Ordering::AcqRel);
        }

        let total_done = self.completed_chunks.fetch_add(1, Ordering::AcqRel) + 1;
        if total_done >= self.total_chunks.load(Ordering::Acquire) {
            self.mark_success();
        }
        now_done
    }

    /// Clear the in-flight marker once no chunk is running
    pub fn chunks_idle(&self) {
        self.chunk_started_ms.store(0, Ordering::Release);
    }

    fn mark_success(&self) {
        let moved = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |phase| match phase {
                PHASE_SUCCESS | PHASE_ERROR => None,
                _ => Some(PHASE_SUCCESS),
            })
            .is_ok();
        if moved {
            self.completed.store(true, Ordering::Release);
            self.chunk_started_ms.store(0, Ordering::Release);
        }
    }

    /// Move to the Error state. The first failure wins; a finished job stays finished.
    pub fn fail(&self, message: impl Into<String>, cancelled: bool) {
        let _ = self.error.set((message.into(), cancelled));
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |phase| match phase {
                PHASE_SUCCESS | PHASE_ERROR => None,
                _ => Some(PHASE_ERROR),
            });
        self.chunk_started_ms.store(0, Ordering::Release);
    }

    // ========== Cancellation ==========

    /// Ask the job to stop; chunks already running are allowed to finish
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    // ========== Readers ==========

    pub fn status(&self) -> JobStatus {
        match self.phase.load(Ordering::Acquire) {
            PHASE_IDLE => JobStatus::Idle,
            PHASE_LOADING => JobStatus::Loading,
            PHASE_PROCESSING => JobStatus::Processing(self.percent()),
            PHASE_SUCCESS => JobStatus::Success,
            _ => {
                let (message, cancelled) = self
                    .error
                    .get()
                    .cloned()
                    .unwrap_or_else(|| (String::from("Unknown error"), false));
                JobStatus::Error { message, cancelled }
            }
        }
    }

    /// Completed work units as a percentage.
    ///
    /// A work unit is a chunk when any image is chunked, otherwise a whole image.
    pub fn percent(&self) -> u8 {
        let (done, total) = if self.chunked.load(Ordering::Acquire) {
            (
                self.completed_chunks.load(Ordering::Acquire),
                self.total_chunks.load(Ordering::Acquire),
            )
        } else {
            (
                self.completed_images.load(Ordering::Acquire),
                self.total_images.load(Ordering::Acquire),
            )
        };
        if total == 0 {
            return 0;
        }
        (done.min(total) * 100 / total) as u8
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// True when any image needs more than one chunk
    pub fn is_chunked(&self) -> bool {
        self.chunked.load(Ordering::Acquire)
    }

    /// 1-based position of the current image (0 before the first image starts)
    pub fn current_image(&self) -> usize {
        self.current_image.load(Ordering::Acquire)
    }

    pub fn current_image_index(&self) -> usize {
        self.current_image_idx.load(Ordering::Acquire)
    }

    pub fn total_images(&self) -> usize {
        self.total_images.load(Ordering::Acquire)
    }

    /// Images not yet fully processed
    pub fn queued_images(&self) -> usize {
        self.total_images()
            .saturating_sub(self.completed_images.load(Ordering::Acquire))
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks.load(Ordering::Acquire)
    }

    pub fn completed_chunks(&self) -> usize {
        self.completed_chunks.load(Ordering::Acquire)
    }

    /// Work units not yet finished across the whole job
    pub fn remaining_chunks(&self) -> usize {
        self.total_chunks().saturating_sub(self.completed_chunks())
    }

    /// (completed, total) chunks for one image
    pub fn image_chunks(&self, image_idx: usize) -> (usize, usize) {
        let done = self
            .completed_per_image
            .get(image_idx)
            .map_or(0, |c| c.load(Ordering::Acquire));
        let total = self
            .chunks_per_image
            .get(image_idx)
            .map_or(0, |c| c.load(Ordering::Acquire));
        (done, total)
    }

    /// Chunk indices of the current image that have been handed out but not
    /// necessarily finished: `[completed, highest started + 1)`
    pub fn active_chunks(&self) -> (usize, usize) {
        let (done, _) = self.image_chunks(self.current_image_index());
        let end = self.active_chunk_end.load(Ordering::Acquire);
        (done.min(end), end)
    }

    /// Time since the most recent chunk started, if one is in flight
    pub fn in_flight_elapsed(&self) -> Option<Duration> {
        match self.chunk_started_ms.load(Ordering::Acquire) {
            0 => None,
            started => {
                let now = self.started_at.elapsed().as_millis() as u64;
                Some(Duration::from_millis(now.saturating_sub(started - 1)))
            }
        }
    }

    /// Human-readable one-line status
    pub fn status_line(&self) -> String {
        match self.status() {
            JobStatus::Idle => String::from("Idle"),
            JobStatus::Loading => String::from("Loading..."),
            JobStatus::Processing(_) => {
                let position = self.current_image();
                if position == 0 {
                    return String::from("Loading...");
                }
                let total = self.total_images();
                let (done, chunks) = self.image_chunks(self.current_image_index());
                if chunks > 1 {
                    format!(
                        "Processing image {} of {} (chunk {} of {})",
                        position, total, done, chunks
                    )
                } else {
                    format!("Processing image {} of {}", position, total)
                }
            }
            JobStatus::Success => {
                let total = self.total_images();
                if total == 1 {
                    String::from("Completed 1 image")
                } else {
                    format!("Completed {} images", total)
                }
            }
            JobStatus::Error { message, .. } => message,
        }
    }
}
