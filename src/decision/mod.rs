pub mod orchestrator;
pub mod risk;
pub mod types;

pub use orchestrator::DecisionOrchestrator;
pub use risk::{RiskCheck, RiskGate, RiskReport};
pub use types::{
    Adjustment, DecisionAction, DecisionOutcome, Direction, EntryStrategy, TradeProposal,
};
