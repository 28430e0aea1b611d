// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Keyed lookup of consumers and publishers.

use crate::errors::MessagingError;
use std::{collections::HashMap, sync::Arc};

/// A string-keyed registry.
///
/// `kind` names what the registry holds and shows up in lookup errors.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Registry<T> {
        Registry {
            kind,
            entries: HashMap::default(),
        }
    }

    /// Registers `entry` under `key`, replacing a previous registration.
    pub fn register(mut self, key: &str, entry: Arc<T>) -> Self {
        self.entries.insert(key.to_owned(), entry);
        self
    }

    /// # Returns
    /// The entry, or `NotFound` carrying the key that was asked for
    pub fn get(&self, key: &str) -> Result<Arc<T>, MessagingError> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| MessagingError::NotFound {
                kind: self.kind,
                key: key.to_owned(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_reported() {
        let registry = Registry::<str>::new("publisher").register("orders", Arc::from("amqp"));

        assert_eq!(&*registry.get("orders").unwrap(), "amqp");
        assert_eq!(
            registry.get("billing").unwrap_err(),
            MessagingError::NotFound {
                kind: "publisher",
                key: "billing".to_owned()
            }
        );
    }
}
