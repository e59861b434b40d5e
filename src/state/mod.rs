/// State management module
///
/// This module holds everything a job carries around, including:
/// - Shared data structures (data.rs)
/// - Job and model configuration (config.rs)
/// - Lock-free progress counters (progress.rs)
/// - Persisted timing averages (timings.rs)

pub mod config;
pub mod data;
pub mod progress;
pub mod timings;
