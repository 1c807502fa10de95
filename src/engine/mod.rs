//! Probing, planning and committing storage layouts.

pub mod commit;
pub mod describe;
pub mod probe;
mod session;

pub use commit::{commit, CommitFailure, CommitOutcome, PlannedAction, Step, StepBuilder};
pub use describe::{describe, human_size, Tense};
pub use probe::probe;
pub use session::Session;
