use crate::Store;
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store unavailable")]
    Unavailable,
}

/// In-memory [Store] shared between clones.
#[derive(Clone, Default)]
pub struct Memory {
    entries: Arc<Mutex<HashMap<Vec<u8>, Bytes>>>,
    failing: Arc<AtomicBool>,
}

impl Memory {
    /// Make every subsequent access fail (or succeed again).
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        Ok(())
    }
}

impl Store for Memory {
    type Error = Error;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&mut self, key: &[u8], value: Bytes) -> Result<(), Error> {
        self.check()?;
        self.entries.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }
}
