//! The supervisor loop and everything it routes between.

pub mod agent;
pub mod directive;
pub mod human;
pub mod responder;
pub mod state;
pub mod supervisor;

pub use human::{Escalation, HumanLoop, Resolution};
pub use state::Completion;
pub use supervisor::{RequestOutcome, Supervisor};
