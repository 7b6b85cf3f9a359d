//! Infrastructure layer: job persistence, queueing and background workers.

pub mod jobs;
