//! Feedsync - keeps stored RSS/Atom subscriptions in step with their sources
//!
//! Feeds are fetched concurrently on a schedule, and their entries are
//! reconciled into SQLite one feed per transaction. A small HTTP surface
//! exposes subscription management and manual refreshes.

pub mod config;
pub mod db;
pub mod error;
pub mod favicon;
pub mod feed;
pub mod outcome;
pub mod reconcile;
pub mod routes;
pub mod transport;
pub mod updater;
