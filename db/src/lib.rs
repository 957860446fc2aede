//! Persistent records for rotary: the identity catalog and the progress
//! ledger, both stored as JSON documents under the agent's data directory.

pub mod models;
pub mod storage;
