// src/services/mod.rs

pub mod coaching;
pub mod routing_engine;
pub mod usage_ledger;

pub use coaching::CoachingService;
pub use routing_engine::AiRoutingEngine;
pub use usage_ledger::UsageLedger;
