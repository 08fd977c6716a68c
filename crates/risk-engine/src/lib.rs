pub mod engine;
pub mod models;
#[cfg(test)]
mod tests;

pub use engine::{RiskEngine, SizingRejection};
pub use models::{
    CloseReason, PositionAction, ProfitLadder, RiskParameters, SizedPosition, SizingProposal,
    TrackedPosition,
};
