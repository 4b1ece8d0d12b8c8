//! Backpressure-aware hand-off between producers and workers

pub mod bounded;

pub use bounded::{
    BoundedActionQueue, OverflowStrategy, PutOutcome, QueueConfig, QueueItem, QueueMetrics,
};
