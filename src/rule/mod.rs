//! Domain routing: static rules and the detection-failure cache

mod detect_cache;
mod policy;

pub use detect_cache::{DetectionCache, DEFAULT_MAX_ENTRIES};
pub use policy::{Decision, PolicyResolver};
