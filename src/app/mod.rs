//! Controller application module: runtime wiring, the work queue, and
//! logging setup.

/// Tracing initialization.
pub mod logging;
/// Coalescing per-key work queue.
pub mod queue;
/// Runtime wiring and the shutdown loop.
pub mod runtime;

// Re-export the public entrypoint so callers keep using `app::run(...)`.
pub use runtime::run;
