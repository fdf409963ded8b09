//! Environment derivation: the build over the data snapshot and the final
//! composition handed to the child.

mod builder;
mod compose;

pub use builder::{BuildOutcome, EnvironmentBuilder};
pub use compose::compose_child_env;
