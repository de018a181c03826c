//! SQL safety gate for a natural-language analytics assistant.
//!
//! Model-generated SQL is validated by [`safety::SafetyGate`] before it can
//! run: a keyword screen, a structural check over the parse tree and a
//! per-database table allow-list. Rejected queries can be sent back to the
//! model through the bounded [`repair::RepairLoop`].

pub mod audit;
pub mod config;
pub mod db;
pub mod llm;
pub mod pipeline;
pub mod repair;
pub mod safety;
pub mod util;
pub mod web;
