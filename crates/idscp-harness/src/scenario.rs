//! Scenario framework: builder, world, and oracle helpers.
//!
//! Every scenario must name an oracle before it can run; there is no way
//! to execute an exchange without verifying its outcome.

mod builder;
mod world;

pub use builder::{RunnableScenario, Scenario};
pub use world::World;

/// Oracle signature: inspects the final world, returns a description of
/// the first violated expectation.
pub type OracleFn = Box<dyn Fn(&World) -> Result<(), String>>;

/// Ready-made oracles for the common assertions.
pub mod oracle {
    use idscp_core::AttestationResult;

    use super::{OracleFn, World};

    /// Every connection reached its terminal state.
    #[must_use]
    pub fn all_completed() -> OracleFn {
        Box::new(|world: &World| {
            if world.all_completed() {
                Ok(())
            } else {
                Err("not every connection reached the terminal state".to_owned())
            }
        })
    }

    /// Every connection recorded this verdict.
    #[must_use]
    pub fn verdicts_are(expected: AttestationResult) -> OracleFn {
        Box::new(move |world: &World| {
            for name in world.actor_names() {
                let verdict = world.verdict(&name);
                if verdict != Some(expected) {
                    return Err(format!("{name}: expected verdict {expected:?}, got {verdict:?}"));
                }
            }
            Ok(())
        })
    }

    /// All of the given oracles, in order; the first failure wins.
    #[must_use]
    pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
        Box::new(move |world: &World| {
            for oracle in &oracles {
                oracle(world)?;
            }
            Ok(())
        })
    }
}
