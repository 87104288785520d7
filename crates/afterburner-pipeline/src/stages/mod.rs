//! The four gates, each a [`StageCapability`](afterburner_core::StageCapability).

pub mod git;
pub mod launch;
pub mod security;
pub mod test;

pub use git::GitStage;
pub use launch::LaunchStage;
pub use security::SecurityStage;
pub use test::TestStage;
