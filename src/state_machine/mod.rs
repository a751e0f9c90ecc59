mod job;
mod state;

pub use job::{AnalysisJob, JobFailure, JobReport};
pub use state::{JobState, StateMachine, Transition};
