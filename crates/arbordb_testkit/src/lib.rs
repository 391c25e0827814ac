//! # ArborDB Testkit
//!
//! Test utilities for ArborDB.
//!
//! This crate provides:
//! - A ready-made entity model and fast-timing store configuration
//! - [`TestStore`], a store over a temporary directory with reopen and
//!   raw-file helpers
//! - [`ManualSync`], a hand-driven change transport for exercising the
//!   peer-synchronization paths without a real watcher
//! - Crash artifact helpers that plant the transient directories an
//!   interrupted process leaves behind
//!
//! ## Usage
//!
//! ```rust,ignore
//! use arbordb_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_store() {
//!     let fixture = TestStore::open().await;
//!     fixture.insert("templates", template("invoice", "<b>x</b>")).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod sync;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::sync::*;
}

pub use crash::*;
pub use fixtures::*;
pub use sync::*;
