//! Fixloop learning store
//!
//! Lessons are (failure signature, guidance) pairs written when a fix
//! session fails or is cancelled, and read back when composing the next
//! strategy prompt so the same mistake is not repeated.

#![warn(unreachable_pub)]

pub mod error;
pub mod signature;
pub mod store;

pub use error::LearningError;
pub use signature::{similarity, FailureSignature, LessonQuery};
pub use store::{LearningStats, LearningStore, Lesson, LessonId, LessonNote};
