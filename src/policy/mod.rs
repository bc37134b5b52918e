//! Pure charging policy: scoring, the critical-SOC wait advisor and the
//! decision priority chain.

pub mod engine;
pub mod scoring;
pub mod wait_advisor;

pub use engine::decide;
pub use scoring::ScoreBreakdown;
pub use wait_advisor::{advise, wait_budget_hours, WaitAdvice, WaitVerdict};
