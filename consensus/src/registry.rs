//! Registry of [Function]s known to the reactor.

use crate::Function;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use thiserror::Error;

/// Errors that can occur when registering a [Function].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("function already registered: {0}")]
    AlreadyRegistered(String),
    #[error("function id cannot be empty")]
    EmptyId,
}

/// Concurrent map from function ID to [Function].
///
/// The registry is not persisted: it is populated at startup by whatever wires up the
/// functions. Cloning a registry yields a handle to the same underlying map.
#[derive(Clone, Default)]
pub struct Registry {
    functions: Arc<RwLock<HashMap<String, Arc<dyn Function>>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the function registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Function>> {
        self.functions.read().unwrap().get(id).cloned()
    }

    /// Register `function` under `id`.
    ///
    /// Fails if `id` is empty or already taken.
    pub fn set(&self, id: impl Into<String>, function: Arc<dyn Function>) -> Result<(), Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::EmptyId);
        }
        let mut functions = self.functions.write().unwrap();
        if functions.contains_key(&id) {
            return Err(Error::AlreadyRegistered(id));
        }
        functions.insert(id, function);
        Ok(())
    }

    /// Returns all registered IDs (unordered).
    pub fn ids(&self) -> Vec<String> {
        self.functions.read().unwrap().keys().cloned().collect()
    }

    /// Returns all registered IDs in ascending order.
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids = self.ids();
        ids.sort();
        ids
    }
}
