// Sync client core
// Pure session/reconciliation state plus the async runtime that drives it

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod manager;
pub mod persistence;
pub mod protocol;
pub mod reconcile;
pub mod reducer;
pub mod runtime;
pub mod view;
