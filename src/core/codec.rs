// Field blob layout: fixed header, then a JSON list of [key, value] entries.
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Serialize, ser};
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::field::Field;

pub const BLOB_MAGIC: [u8; 4] = *b"FDB1";
pub const BLOB_VERSION: u32 = 1;
pub const BLOB_HEADER_LEN: usize = 64;
pub const ENCODING_JSON_ENTRIES: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlobHeader {
    pub encoding: u8,
    pub entry_count: u64,
    pub body_len: u64,
    pub digest: [u8; 32],
}

impl BlobHeader {
    fn for_body(entry_count: u64, body: &[u8]) -> Self {
        Self {
            encoding: ENCODING_JSON_ENTRIES,
            entry_count,
            body_len: body.len() as u64,
            digest: body_digest(body),
        }
    }

    pub fn encode(&self) -> [u8; BLOB_HEADER_LEN] {
        let mut buf = [0u8; BLOB_HEADER_LEN];
        buf[0..4].copy_from_slice(&BLOB_MAGIC);
        buf[4..8].copy_from_slice(&BLOB_VERSION.to_le_bytes());
        buf[8] = self.encoding;
        write_u64(&mut buf, 16, self.entry_count);
        write_u64(&mut buf, 24, self.body_len);
        buf[32..64].copy_from_slice(&self.digest);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < BLOB_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("field header too small"));
        }
        if buf[0..4] != BLOB_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad field magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != BLOB_VERSION {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("unsupported field format version {version}")));
        }
        let encoding = buf[8];
        if encoding != ENCODING_JSON_ENTRIES {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("unsupported field encoding {encoding}")));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&buf[32..64]);

        Ok(Self {
            encoding,
            entry_count: read_u64(buf, 16),
            body_len: read_u64(buf, 24),
            digest,
        })
    }

    pub fn validate(&self, body: &[u8]) -> Result<(), Error> {
        if self.body_len != body.len() as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("field body length mismatch"));
        }
        if self.digest != body_digest(body) {
            return Err(Error::new(ErrorKind::Corrupt).with_message("field digest mismatch"));
        }
        Ok(())
    }
}

/// Serialize a whole field into one blob.
///
/// Bare `f32`/`f64` NaN or infinity anywhere in a key or value is rejected:
/// JSON would store it as `null`, and the blob would not load back.
/// [`Value`](crate::core::value::Value) tags those floats itself.
pub fn encode_field<K, V>(field: &Field<K, V>) -> Result<Vec<u8>, Error>
where
    K: Eq + Hash + Serialize,
    V: Serialize,
{
    let entries: Vec<(&K, &V)> = field.iter().collect();
    let body = serde_json::to_vec(&entries).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("field entries are not serializable")
            .with_source(err)
    })?;
    entries.serialize(&mut FiniteFloats).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("field entries contain a non-finite float")
            .with_hint("Store NaN and infinities as `Value::Float`, or replace them before dumping.")
            .with_source(err)
    })?;
    let header = BlobHeader::for_body(entries.len() as u64, &body);

    let mut out = Vec::with_capacity(BLOB_HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a blob produced by [`encode_field`]; any inconsistency is `Corrupt`.
pub fn decode_field<K, V>(bytes: &[u8]) -> Result<Field<K, V>, Error>
where
    K: Eq + Hash + DeserializeOwned,
    V: DeserializeOwned,
{
    let header = BlobHeader::decode(bytes)?;
    let body = &bytes[BLOB_HEADER_LEN..];
    header.validate(body)?;

    let entries: Vec<(K, V)> = serde_json::from_slice(body).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("field entries failed to decode")
            .with_source(err)
    })?;
    if entries.len() as u64 != header.entry_count {
        return Err(Error::new(ErrorKind::Corrupt).with_message("field entry count mismatch"));
    }

    let mut map = HashMap::with_capacity(entries.len());
    for (key, value) in entries {
        if map.insert(key, value).is_some() {
            return Err(Error::new(ErrorKind::Corrupt).with_message("duplicate key in field"));
        }
    }
    Ok(Field::from(map))
}

#[derive(Debug)]
struct ScanError(String);

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ScanError {}

impl ser::Error for ScanError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Serializer that produces nothing and fails on the first NaN or infinity.
struct FiniteFloats;

type Scan = Result<(), ScanError>;

fn check_finite(n: f64) -> Scan {
    if n.is_finite() {
        Ok(())
    } else {
        Err(ScanError(format!("{n} has no JSON encoding")))
    }
}

impl ser::Serializer for &mut FiniteFloats {
    type Ok = ();
    type Error = ScanError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Scan {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Scan {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Scan {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Scan {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Scan {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Scan {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Scan {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Scan {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Scan {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Scan {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Scan {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Scan {
        check_finite(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Scan {
        check_finite(v)
    }
    fn serialize_char(self, _: char) -> Scan {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Scan {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Scan {
        Ok(())
    }
    fn serialize_none(self) -> Scan {
        Ok(())
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Scan {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Scan {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Scan {
        Ok(())
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Scan {
        Ok(())
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(self, _: &'static str, value: &T) -> Scan {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Scan {
        value.serialize(self)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, ScanError> {
        Ok(self)
    }
}

macro_rules! scan_elements {
    ($($compound:ident::$method:ident),* $(,)?) => {$(
        impl ser::$compound for &mut FiniteFloats {
            type Ok = ();
            type Error = ScanError;

            fn $method<T: ?Sized + Serialize>(&mut self, value: &T) -> Scan {
                value.serialize(&mut **self)
            }

            fn end(self) -> Scan {
                Ok(())
            }
        }
    )*};
}

scan_elements!(
    SerializeSeq::serialize_element,
    SerializeTuple::serialize_element,
    SerializeTupleStruct::serialize_field,
    SerializeTupleVariant::serialize_field,
);

impl ser::SerializeMap for &mut FiniteFloats {
    type Ok = ();
    type Error = ScanError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Scan {
        key.serialize(&mut **self)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Scan {
        value.serialize(&mut **self)
    }

    fn end(self) -> Scan {
        Ok(())
    }
}

macro_rules! scan_fields {
    ($($compound:ident),* $(,)?) => {$(
        impl ser::$compound for &mut FiniteFloats {
            type Ok = ();
            type Error = ScanError;

            fn serialize_field<T: ?Sized + Serialize>(&mut self, _: &'static str, value: &T) -> Scan {
                value.serialize(&mut **self)
            }

            fn end(self) -> Scan {
                Ok(())
            }
        }
    )*};
}

scan_fields!(SerializeStruct, SerializeStructVariant);

fn body_digest(body: &[u8]) -> [u8; 32] {
    Sha256::digest(body).into()
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
