// Per-field blob persistence under one data root, plus advisory field locks.
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::codec::{decode_field, encode_field};
use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::field::Field;
use crate::field_names::{check_store_name, field_blob_path, field_lock_path, field_name_from_file};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Durability {
    /// Write and flush the file handle; leave syncing to the OS.
    #[default]
    Fast,
    /// Also `fsync` the blob before returning.
    Flush,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<String>,
}

/// Whole-field load/dump keyed by field name.
///
/// Holds only the data root and an optional list of declared names; every
/// load re-reads the blob from disk.
#[derive(Clone, Debug)]
pub struct FieldStore {
    root: PathBuf,
    declared: BTreeSet<String>,
}

impl FieldStore {
    /// Open (creating if needed) the data root. A root that exists but is not
    /// a directory is a configuration error.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        match std::fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::new(ErrorKind::Config)
                    .with_message("data root is not a directory")
                    .with_path(&root)
                    .with_hint("Point --dir at a directory, or remove the file in the way."));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&root).map_err(|err| {
                    Error::new(io_error_kind(&err))
                        .with_message("failed to create data root")
                        .with_path(&root)
                        .with_source(err)
                })?;
                tracing::debug!(root = %root.display(), "created data root");
            }
            Err(err) => {
                return Err(Error::new(io_error_kind(&err))
                    .with_message("failed to inspect data root")
                    .with_path(&root)
                    .with_source(err));
            }
        }

        Ok(Self {
            root,
            declared: BTreeSet::new(),
        })
    }

    /// Record field names for documentation purposes. Undeclared names stay usable.
    pub fn with_declared_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn declared_fields(&self) -> impl Iterator<Item = &str> {
        self.declared.iter().map(String::as_str)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    pub fn field_path(&self, name: &str) -> Result<PathBuf, Error> {
        check_store_name(name).map_err(|err| Error::from(err).with_field(name))?;
        Ok(field_blob_path(&self.root, name))
    }

    /// Load a whole field. A field that was never dumped loads as empty; a
    /// blob that exists but cannot be decoded is an error.
    pub fn load_field<K, V>(&self, name: &str) -> Result<Field<K, V>, Error>
    where
        K: Eq + Hash + DeserializeOwned,
        V: DeserializeOwned,
    {
        let path = self.field_path(name)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(field = name, "field absent; loading empty");
                return Ok(Field::new());
            }
            Err(err) => {
                return Err(Error::new(io_error_kind(&err))
                    .with_message("failed to read field")
                    .with_field(name)
                    .with_path(&path)
                    .with_source(err));
            }
        };

        let field = decode_field(&bytes).map_err(|err| err.with_field(name).with_path(&path))?;
        tracing::debug!(field = name, entries = field.len(), "loaded field");
        Ok(field)
    }

    pub fn dump_field<K, V>(&self, name: &str, field: &Field<K, V>) -> Result<(), Error>
    where
        K: Eq + Hash + Serialize,
        V: Serialize,
    {
        self.dump_field_with(name, field, Durability::Fast)
    }

    /// Replace the field's blob with `field` in full. Readers racing this call
    /// may observe a partially written blob.
    pub fn dump_field_with<K, V>(
        &self,
        name: &str,
        field: &Field<K, V>,
        durability: Durability,
    ) -> Result<(), Error>
    where
        K: Eq + Hash + Serialize,
        V: Serialize,
    {
        let path = self.field_path(name)?;
        let blob = encode_field(field).map_err(|err| err.with_field(name))?;

        let io_err = |err: io::Error| {
            Error::new(io_error_kind(&err))
                .with_message("failed to write field")
                .with_field(name)
                .with_path(&path)
                .with_source(err)
        };
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(&blob).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        if durability == Durability::Flush {
            file.sync_all().map_err(io_err)?;
        }

        tracing::debug!(field = name, entries = field.len(), bytes = blob.len(), "dumped field");
        Ok(())
    }

    /// Fields present on disk, sorted by name.
    pub fn list_fields(&self) -> Result<Vec<FieldInfo>, Error> {
        let entries = std::fs::read_dir(&self.root).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to read data root")
                .with_path(&self.root)
                .with_source(err)
        })?;

        let mut fields = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read data root entry")
                    .with_path(&self.root)
                    .with_source(err)
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(field_name_from_file) else {
                continue;
            };
            if check_store_name(name).is_err() {
                continue;
            }
            fields.push(self.field_info(name)?);
        }
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(fields)
    }

    pub fn field_info(&self, name: &str) -> Result<FieldInfo, Error> {
        let path = self.field_path(name)?;
        let meta = std::fs::metadata(&path).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("field not found")
                .with_field(name)
                .with_path(&path)
                .with_source(err)
        })?;
        Ok(FieldInfo {
            name: name.to_string(),
            size_bytes: meta.len(),
            modified: meta.modified().ok().and_then(format_time),
            path,
        })
    }

    pub fn delete_field(&self, name: &str) -> Result<(), Error> {
        let path = self.field_path(name)?;
        std::fs::remove_file(&path).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to delete field")
                .with_field(name)
                .with_path(&path)
                .with_source(err)
        })?;
        tracing::debug!(field = name, "deleted field");
        Ok(())
    }

    /// Block until this process holds the advisory lock for `name`.
    ///
    /// Load and dump never take this lock themselves.
    pub fn lock_field(&self, name: &str) -> Result<FieldLock, Error> {
        let file = self.open_lock_file(name)?;
        file.lock_exclusive().map_err(|err| self.lock_error(name, err))?;
        Ok(FieldLock { file })
    }

    /// Like [`FieldStore::lock_field`] but fails with `Busy` instead of waiting.
    pub fn try_lock_field(&self, name: &str) -> Result<FieldLock, Error> {
        let file = self.open_lock_file(name)?;
        file.try_lock_exclusive().map_err(|err| self.lock_error(name, err))?;
        Ok(FieldLock { file })
    }

    fn open_lock_file(&self, name: &str) -> Result<File, Error> {
        check_store_name(name).map_err(|err| Error::from(err).with_field(name))?;
        let path = field_lock_path(&self.root, name);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                Error::new(io_error_kind(&err))
                    .with_message("failed to open field lock")
                    .with_field(name)
                    .with_path(&path)
                    .with_source(err)
            })
    }

    fn lock_error(&self, name: &str, err: io::Error) -> Error {
        Error::new(lock_error_kind(&err))
            .with_message("failed to lock field")
            .with_field(name)
            .with_path(field_lock_path(&self.root, name))
            .with_source(err)
    }
}

/// Held advisory lock on one field; released on drop.
#[derive(Debug)]
pub struct FieldLock {
    file: File,
}

impl Drop for FieldLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn format_time(time: SystemTime) -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::from(time).format(&Rfc3339).ok()
}
