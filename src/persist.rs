//! Persisted-variable file
//!
//! A flat sequence of records: name length (u32 LE), payload length
//! (u32 LE), name bytes, payload bytes. The file is read on first use and
//! rewritten in full whenever a record changes. Records for names the
//! current program does not declare are kept as they are.

use crate::error::{ErrorKind, FerruleError, Result};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Payload encodings per persisted type
#[derive(Debug, Clone, PartialEq)]
pub enum Persisted {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Persisted {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Persisted::Int(n) => n.to_le_bytes().to_vec(),
            Persisted::Float(n) => n.to_bits().to_le_bytes().to_vec(),
            Persisted::Bool(b) => vec![*b as u8],
            Persisted::Str(s) => s.as_bytes().to_vec(),
        }
    }
}

pub struct PersistStore {
    path: PathBuf,
    records: Option<IndexMap<String, Vec<u8>>>,
}

impl PersistStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), records: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.records.is_some()
    }

    fn io_error(&self, what: &str, err: impl std::fmt::Display) -> FerruleError {
        FerruleError::new(ErrorKind::Io(format!("{} {}: {}", what, self.path.display(), err)), None)
    }

    /// Read the file if that has not happened yet; a missing file is empty
    pub fn load(&mut self) -> Result<()> {
        if self.records.is_some() {
            return Ok(());
        }
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(self.io_error("cannot read", err)),
        };
        let records = decode_records(&bytes).map_err(|why| self.io_error("corrupt persisted file", why))?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "loaded persisted variables");
        self.records = Some(records);
        Ok(())
    }

    pub fn get(&mut self, name: &str) -> Result<Option<&[u8]>> {
        self.load()?;
        Ok(self.records.as_ref().and_then(|r| r.get(name)).map(Vec::as_slice))
    }

    /// Update one record and rewrite the whole file
    pub fn set(&mut self, name: &str, value: &Persisted) -> Result<()> {
        self.load()?;
        let records = self.records.get_or_insert_with(IndexMap::new);
        records.insert(name.to_string(), value.encode());
        let bytes = encode_records(records);
        std::fs::write(&self.path, bytes).map_err(|err| self.io_error("cannot write", err))?;
        tracing::trace!(path = %self.path.display(), name, "rewrote persisted variables");
        Ok(())
    }
}

pub fn encode_records(records: &IndexMap<String, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, payload) in records {
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(payload);
    }
    out
}

pub fn decode_records(mut bytes: &[u8]) -> std::result::Result<IndexMap<String, Vec<u8>>, String> {
    fn take<'a>(bytes: &mut &'a [u8], n: usize) -> std::result::Result<&'a [u8], String> {
        if bytes.len() < n {
            return Err("truncated record".to_string());
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Ok(head)
    }
    fn length(bytes: &mut &[u8]) -> std::result::Result<usize, String> {
        let raw = take(bytes, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    let mut records = IndexMap::new();
    while !bytes.is_empty() {
        let name_len = length(&mut bytes)?;
        let payload_len = length(&mut bytes)?;
        let name = String::from_utf8(take(&mut bytes, name_len)?.to_vec()).map_err(|_| "name is not UTF-8".to_string())?;
        let payload = take(&mut bytes, payload_len)?.to_vec();
        records.insert(name, payload);
    }
    Ok(records)
}

/// Decode a payload for a variable of the given kind
pub fn decode_int(payload: &[u8]) -> Option<i64> {
    payload.try_into().ok().map(i64::from_le_bytes)
}

pub fn decode_float(payload: &[u8]) -> Option<f64> {
    payload.try_into().ok().map(|b| f64::from_bits(u64::from_le_bytes(b)))
}

pub fn decode_bool(payload: &[u8]) -> Option<bool> {
    match payload {
        [b] => Some(*b != 0),
        _ => None,
    }
}

pub fn decode_string(payload: &[u8]) -> Option<String> {
    String::from_utf8(payload.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let mut records = IndexMap::new();
        records.insert("n".to_string(), Persisted::Int(7).encode());
        let bytes = encode_records(&records);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &8u32.to_le_bytes());
        assert_eq!(bytes[8], b'n');
        assert_eq!(decode_int(&bytes[9..]), Some(7));
        assert!(decode_records(&bytes[..10]).is_err());
    }

    #[test]
    fn test_store_rewrites_and_keeps_unknown_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.persist");

        let mut store = PersistStore::new(&path);
        assert_eq!(store.get("count").unwrap(), None);
        store.set("count", &Persisted::Int(3)).unwrap();
        store.set("other", &Persisted::Str("kept".into())).unwrap();
        store.set("count", &Persisted::Int(4)).unwrap();

        let mut reopened = PersistStore::new(&path);
        assert_eq!(reopened.get("count").unwrap().and_then(decode_int), Some(4));
        assert_eq!(reopened.get("other").unwrap().and_then(decode_string), Some("kept".to_string()));
    }
}
