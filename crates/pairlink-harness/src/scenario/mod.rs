//! Scenario framework.
//!
//! A scenario is a list of steps applied to a [`World`], followed by an
//! oracle that checks the final state. The oracle is mandatory.

mod builder;
pub mod world;

pub use builder::{RunnableScenario, Scenario, Step};
pub use world::World;

/// Verifies the final world. Returns a description of the first violation.
pub type OracleFn = Box<dyn Fn(&World) -> Result<(), String>>;
