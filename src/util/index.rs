//! In-memory key to id index (volume names, snapshot owners)

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct Index {
    data: HashMap<String, String>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `key` to `value`; re-adding the same pair is a no-op
    pub fn add(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || value.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "invalid index entry {:?} -> {:?}",
                key, value
            )));
        }
        match self.data.get(key) {
            Some(existing) if existing == value => Ok(()),
            Some(existing) => Err(Error::AlreadyExists(format!(
                "{} already maps to {}",
                key, existing
            ))),
            None => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Result<String> {
        self.data
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("index key {}", key)))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_add_get_remove() {
        let mut index = Index::new();
        index.add("db", "uuid-1").unwrap();
        index.add("db", "uuid-1").unwrap();
        assert!(matches!(index.add("db", "uuid-2"), Err(Error::AlreadyExists(_))));
        assert!(index.add("", "uuid-3").is_err());

        assert_eq!(index.get("db"), Some("uuid-1"));
        assert_eq!(index.remove("db").unwrap(), "uuid-1");
        assert!(index.get("db").is_none());
        assert!(matches!(index.remove("db"), Err(Error::NotFound(_))));
        assert!(index.is_empty());
    }
}
