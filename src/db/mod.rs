//! Raw-SQL operation modules, one per entity group.
//!
//! All work claiming uses `SELECT ... FOR UPDATE SKIP LOCKED` inside a short
//! transaction that also advances the row's due timestamp by a lease, so
//! concurrent workers never pick the same target and a dead worker's claim
//! expires on its own. No function here holds a transaction across a backend
//! call.

pub mod cluster;
pub mod commitments;
pub mod mail;
pub mod projects;
pub mod rates;
pub mod reports;
pub mod resources;
pub mod services;
