//! Behavior-learning core for home automation
//!
//! Observes device state changes, filters and enriches them with context,
//! and learns recurring routines, multi-device scenes and cross-device
//! correlations with bounded, decaying confidence.

pub mod config;
pub mod context;
pub mod correlation;
pub mod detector;
pub mod engine;
pub mod error;
pub mod filter;
pub mod model;
pub mod persistence;
pub mod retry;
pub mod scene;
pub mod scheduler;
pub mod scorer;
pub mod stats;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Collaborators, EngineEvent, PassReport, PatternEngine, Suggestion};
pub use error::EngineError;
pub use model::*;
pub use store::{JsonPatternStore, MemoryPatternStore, PatternFilter, PatternStore};
