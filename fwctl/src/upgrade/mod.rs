//! Upgrade orchestration module

pub mod classifier;
pub mod diagnostics;
pub mod engine;
pub mod fsm;
pub mod guard;
pub mod launcher;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod scripted;
pub mod supervisor;
pub mod transfer;
pub mod transport;
