//! linkprobe - end-to-end check of LedgerLink sessions
//!
//! Starts two nodes on an in-process ledger and loopback network, connects
//! them by username and pushes framed messages across the session.

pub mod config;
pub mod probe;
