/// Restoration pipeline
///
/// - Tile planning and stitching (tiling.rs)
/// - Engine/scorer traits and per-tile plumbing (engine.rs)
/// - Output orientation repair (orientation.rs)
/// - Adaptive strength search (search.rs)
/// - Processing-time estimation (timing.rs)
/// - Job orchestration (orchestrator.rs)

pub mod engine;
pub mod orchestrator;
pub mod orientation;
pub mod search;
pub mod tiling;
pub mod timing;
