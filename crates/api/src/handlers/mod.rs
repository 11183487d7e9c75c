pub mod batches;
pub mod callbacks;
pub mod jobs;
pub mod stats;
