//! Conversation memory for a single session.
//!
//! - [`ContextWindow`]: sliding-window turn log with budgeted history
//! - [`TokenEstimator`]: pluggable token counting
//! - [`Summarizer`]: optional hook that compresses older turns

pub mod summarizer;
pub mod token;
pub mod window;

pub use summarizer::Summarizer;
pub use token::{CharRatioEstimator, HeuristicEstimator, TokenEstimator};
pub use window::{ContextWindow, Eviction, WindowSettings, WindowStats};
