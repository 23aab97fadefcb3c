//! Shared vocabulary for the envmatrix orchestrator and the child processes it spawns.
//!
//! This crate is intentionally small and dependency-light. Everything in it must be able to cross a
//! process-spawn boundary, so every type here is plain data with `serde` support.
//!
//! ## Notes
//!
//! - **No IO**, no global state, no async runtime. The layering test in the root crate enforces that this crate
//!   never depends on `tokio`.
//! - Variant indices are stable: the same descriptor always yields the same ordering, so cache keys and result
//!   keys are reproducible between runs.

pub mod options;
pub mod outcome;
pub mod variant;

pub use options::{EnvFilter, RunOptions};
pub use outcome::{EnvKey, Outcome, aggregate_exit_code};
pub use variant::{InstrumentationMethod, VariantDescriptor};
