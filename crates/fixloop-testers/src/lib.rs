//! Fixloop persona testers
//!
//! A closed set of personas, each with a scenario catalogue. Running a
//! scenario is a two-step pipeline: a pure evaluation that yields zero or
//! one issue per judgement, then an explicit enqueue into an [`IssueSink`].

#![warn(unreachable_pub)]

pub mod evaluate;
pub mod probe;
pub mod scenario;
pub mod sink;
pub mod tester;

pub use evaluate::{evaluate_experience, evaluation_prompt};
pub use fixloop_kernel::Persona;
pub use probe::{HttpProbe, PageLoad, PageProbe};
pub use scenario::{catalogue, Scenario};
pub use sink::{report_all, ChannelSink, IssueSink, SinkError};
pub use tester::Tester;
