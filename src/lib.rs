//! # Munin
//!
//! A log file intake pipeline. Files dropped into a watch directory are
//! claimed, parsed into normalized events by a sniffed parser, queued
//! durably, and delivered to a sink. Files that cannot be ingested are
//! quarantined with a reason note.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────┐
//! │ incoming │──▶│ processing │──▶│ retry queue │──▶│   sink   │
//! │ (watch)  │   │ sniff+parse│   │  (SQLite)   │   │local/http│
//! └──────────┘   └─────┬──────┘   └─────────────┘   └──────────┘
//!                      │ failure
//!                      ▼
//!                ┌────────────┐
//!                │ quarantine │
//!                └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, env overrides, validation |
//! | [`db`] | Store handle and on-disk size |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Core data types |
//! | [`normalize`] | Event normalization, content hashing, timestamp parsing |
//! | [`parsers`] | Parser traits, registry, built-in formats |
//! | [`sniff`] | Parser selection from a file sample |
//! | [`manifest`] | File records and status transitions |
//! | [`fsutil`] | Stability checks, atomic moves, hashing, ignore rules |
//! | [`sink`] | Delivery targets |
//! | [`queue`] | Durable retry queue and drain worker |
//! | [`quota`] | Store size enforcement |
//! | [`quarantine`] | Quarantine capture and purge |
//! | [`alerts`] | Operator alerts |
//! | [`intake`] | Per-file state machine |
//! | [`watcher`] | Long-running pipeline |
//! | [`stats`] | Statistics for `munin stats` |

pub mod alerts;
pub mod config;
pub mod db;
pub mod fsutil;
pub mod intake;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod parsers;
pub mod quarantine;
pub mod queue;
pub mod quota;
pub mod sink;
pub mod sniff;
pub mod stats;
pub mod watcher;
