//! # Rocketship Utility Library
//!
//! Leaf helpers shared by the engine and server crates: JSON-path navigation
//! over plugin output, canonical string coercion for assertion comparison,
//! duration parsing for retry and timeout fields, and sensitive-value
//! redaction applied before step configuration is persisted.

pub mod coerce;
pub mod duration;
pub mod json_path;
pub mod redact;

pub use coerce::canonical_string;
pub use duration::parse_duration;
pub use json_path::{evaluate_json_path, evaluate_json_path_owned};
pub use redact::{redact_sensitive, redact_value};
