//! Purpose: Columnar key-value store library backing the `fielddb` CLI and HTTP server.
//! Exports: `api` (stable facade), `core` (storage, codec, query engine, errors),
//!   `expr` (jq-style predicates), `field_names` (naming and path rules).
//! Role: Each field is an independent key->value mapping persisted as one blob; queries
//!   join fields by key and filter with caller-supplied predicates.
//! Invariants: Fields are loaded and dumped whole; there is no partial read or write.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod expr;
pub mod field_names;
