//! Purpose: Define the stable public Rust API boundary for fielddb.
//! Exports: Store, query, value, and expression types needed by the CLI, server, and callers.
//! Role: Public, additive-only surface over the core modules.
//! Invariants: Everything a caller needs to load, dump, and query fields is reachable from here.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::field::Field;
pub use crate::core::query::{Groups, JoinMode, QueryEngine};
pub use crate::core::store::{Durability, FieldInfo, FieldLock, FieldStore};
pub use crate::core::value::Value;
pub use crate::expr::{FieldExpr, compile_expr};
pub use crate::field_names::{FieldNameError, check_boundary_name, parse_field_list};
