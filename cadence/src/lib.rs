//! Persistent milestone/task orchestration engine.
//!
//! A dependency-aware scheduler, a milestone state machine and a
//! fixed-iteration refinement loop over one SQLite database. The layering:
//!
//! - **[`core`]**: Pure, deterministic logic (eligibility, transition legality,
//!   cycle detection, complexity tiers). No I/O.
//! - **[`store`]**: Schema, row access and the transaction boundary. Every
//!   mutation runs inside one IMMEDIATE transaction.
//! - **[`machine`]** and **[`plan`]**: State transitions and the planning
//!   import, applied inside a transaction.
//! - **[`facade`]**: The single entry point for performers and the CLI; owns
//!   the store and applies the snapshot policy of [`backup`].
//!
//! [`drive`] runs the work queue against a [`drive::WorkExecutor`];
//! [`refine`] runs the refinement loop once every milestone is complete.

pub mod backup;
pub mod config;
pub mod core;
pub mod drive;
pub mod error;
pub mod exit_codes;
pub mod export;
pub mod facade;
pub mod logging;
pub mod machine;
pub mod paths;
pub mod plan;
pub mod process;
pub mod refine;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
