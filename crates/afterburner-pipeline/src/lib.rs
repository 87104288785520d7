//! Afterburner Pipeline - gated delivery for freshly written code
//!
//! Provides the pipeline orchestrator that:
//! - Resolves the ChangeSet since the last baseline
//! - Runs the Security, Test, Git and Launch gates in order
//! - Self-debugs failing tests and re-audits any code the fixes touched
//! - Parks on pull request review and resumes from persisted state
//! - Seals a Summary and advances the baseline with compare-and-swap

pub mod adapters;
pub mod gate;
pub mod orchestrator;
pub mod runner;
pub mod spec;
pub mod stages;
pub mod state;

// Re-export key types
pub use adapters::command_stage_set;
pub use gate::{CompletionGate, GateVerdict, StageGate};
pub use orchestrator::{Orchestrator, RunOutcome, StageSet};
pub use runner::{run_command, CommandOutput, CommandSpec};
pub use spec::RunSpec;
pub use stages::{GitStage, LaunchStage, SecurityStage, TestStage};
pub use state::{next_state, StepOutcome};
