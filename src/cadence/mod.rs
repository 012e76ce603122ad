//! Cadence: the follow-up schedule table, the periodic engine and its sweeps.

pub mod engine;
pub mod sweeps;
pub mod table;

pub use engine::{CadenceEngine, PassReport, spawn_ticker};
pub use table::{ActionClass, CadenceDecision, CadenceInput, CadenceTable, Phase};
