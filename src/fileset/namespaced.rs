//! # Namespaced Key-Value View
//!
//! A thin, string-keyed view over one prefix of the store. The misc lane
//! (schema version, minimum compatible release) and the per-folder virtual
//! mtime lane are accessed through it. Integers are stored big-endian,
//! strings raw.

use eyre::Result;

use crate::storage::{Reader, Writer};

#[derive(Debug, Clone)]
pub struct NamespacedKv {
    prefix: Vec<u8>,
}

impl NamespacedKv {
    pub fn new(prefix: Vec<u8>) -> Self {
        Self { prefix }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn key(&self, name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + name.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(name.as_bytes());
        key
    }

    pub fn put_i64(&self, w: &mut dyn Writer, name: &str, value: i64) -> Result<()> {
        w.put(&self.key(name), &value.to_be_bytes())
    }

    pub fn i64(&self, r: &impl Reader, name: &str) -> Result<Option<i64>> {
        Ok(r.get(&self.key(name))?.and_then(|bytes| {
            let raw: [u8; 8] = bytes.as_slice().try_into().ok()?;
            Some(i64::from_be_bytes(raw))
        }))
    }

    pub fn put_string(&self, w: &mut dyn Writer, name: &str, value: &str) -> Result<()> {
        w.put(&self.key(name), value.as_bytes())
    }

    pub fn string(&self, r: &impl Reader, name: &str) -> Result<Option<String>> {
        Ok(r.get(&self.key(name))?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    pub fn put_bytes(&self, w: &mut dyn Writer, name: &str, value: &[u8]) -> Result<()> {
        w.put(&self.key(name), value)
    }

    pub fn bytes(&self, r: &impl Reader, name: &str) -> Result<Option<Vec<u8>>> {
        r.get(&self.key(name))
    }

    pub fn delete(&self, w: &mut dyn Writer, name: &str) -> Result<()> {
        w.delete(&self.key(name))
    }
}
