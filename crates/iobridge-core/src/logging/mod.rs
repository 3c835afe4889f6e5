//! Structured logging for host processes.
//!
//! The browser may run several host instances at once (one per profile),
//! so each one appends to its own JSONL file:
//!
//! ```text
//! <log_dir>/
//! └── raw/
//!     ├── 2026-10-16_host-4242.jsonl
//!     └── 2026-10-16_host-4317.jsonl
//! ```
//!
//! Human-readable output goes to stderr. Stdout carries the control
//! channel and must never receive log lines.
//!
//! ```bash
//! # Failed relay sockets across every instance
//! jq 'select(.target | startswith("iobridge_core::relay")) | select(.level == "warn")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogEntry;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::InstanceLogWriter;

/// Instance name used in log file names.
pub fn instance_name(pid: u32) -> String {
    format!("host-{}", pid)
}
