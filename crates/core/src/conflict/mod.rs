//! Collision detection and resolution for sync-mode rules.
//!
//! 1. **Detection** classifies a file present on both sides as in sync,
//!    newer on one side, or a collision.
//! 2. **Resolution** turns a collision into an update direction, either by
//!    latest modification or by asking a [`DecisionSink`].

pub mod detector;
pub mod resolver;

pub use detector::{Collision, CollisionDetector, Comparison};
pub use resolver::{CollisionResolver, Decision, DecisionSink, SkipAll};
