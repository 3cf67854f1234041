//! Reconciliation scanner for the identity map.
//!
//! Walks the forum users table and fills in what the login path would
//! otherwise discover one user at a time: missing identity rows, host links
//! by normalized login, video links by username, and blocked video accounts.

pub mod scan;

pub use scan::{ReconcileScanner, ScanReport, DEFAULT_BATCH_SIZE};
