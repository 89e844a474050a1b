//! Purpose: Field-name validation and blob path resolution helpers.
//! Exports: `FieldNameError`, `check_store_name`, `check_boundary_name`, `parse_field_list`,
//!   `default_data_dir`, `field_blob_path`, `field_lock_path`.
//! Role: Keep store, CLI and HTTP naming rules aligned from one source.
//! Invariants: A field name is used verbatim as part of one file name under the data root.
//! Invariants: Store names never contain path separators or NUL.
//! Invariants: Boundary names (untrusted input) additionally exclude `.`, whitespace and controls.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

pub const FIELD_FILE_PREFIX: &str = "field_";
pub const FIELD_FILE_EXTENSION: &str = "fdb";
pub const LOCK_FILE_EXTENSION: &str = "lock";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldNameError {
    Empty,
    ContainsPathSeparator,
    ContainsNul,
    ContainsDot,
    ContainsWhitespace,
    ContainsControl,
}

impl fmt::Display for FieldNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FieldNameError::Empty => "field name must not be empty",
            FieldNameError::ContainsPathSeparator => "field name must not contain path separators",
            FieldNameError::ContainsNul => "field name must not contain NUL",
            FieldNameError::ContainsDot => "field name must not contain '.'",
            FieldNameError::ContainsWhitespace => "field name must not contain whitespace",
            FieldNameError::ContainsControl => "field name must not contain control characters",
        };
        f.write_str(text)
    }
}

impl From<FieldNameError> for Error {
    fn from(err: FieldNameError) -> Self {
        Error::new(ErrorKind::Usage)
            .with_message(err.to_string())
            .with_hint("Use names like `orientation_down` or `price-eur`.")
    }
}

pub fn check_store_name(name: &str) -> Result<(), FieldNameError> {
    if name.is_empty() {
        return Err(FieldNameError::Empty);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(FieldNameError::ContainsPathSeparator);
    }
    if name.contains('\0') {
        return Err(FieldNameError::ContainsNul);
    }
    Ok(())
}

pub fn check_boundary_name(name: &str) -> Result<(), FieldNameError> {
    check_store_name(name)?;
    if name.contains('.') {
        return Err(FieldNameError::ContainsDot);
    }
    if name.chars().any(char::is_whitespace) {
        return Err(FieldNameError::ContainsWhitespace);
    }
    if name.chars().any(char::is_control) {
        return Err(FieldNameError::ContainsControl);
    }
    Ok(())
}

/// Split `a,b,c` into boundary-checked names, keeping the given order.
pub fn parse_field_list(raw: &str) -> Result<Vec<String>, Error> {
    let mut names = Vec::new();
    for part in raw.split(',') {
        let name = part.trim();
        check_boundary_name(name)?;
        names.push(name.to_string());
    }
    Ok(names)
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".fielddb").join("fields")
}

pub fn field_blob_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{FIELD_FILE_PREFIX}{name}.{FIELD_FILE_EXTENSION}"))
}

pub fn field_lock_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{FIELD_FILE_PREFIX}{name}.{LOCK_FILE_EXTENSION}"))
}

/// Recover a field name from a blob file name, if it is one.
pub fn field_name_from_file(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(FIELD_FILE_EXTENSION)?.strip_suffix('.')?;
    let name = stem.strip_prefix(FIELD_FILE_PREFIX)?;
    if name.is_empty() { None } else { Some(name) }
}
