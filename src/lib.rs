// modgate: multi-detector image moderation.
//
// This is the library root. Each module corresponds to a major subsystem
// of the moderation pipeline.

pub mod config;
pub mod detectors;
pub mod frames;
pub mod output;
pub mod phash;
pub mod pipeline;
pub mod resilience;
pub mod state;
pub mod status;
pub mod verdict;
