pub mod placement;

pub use placement::{NoEligibleNode, PlacementEngine, Rejection};
