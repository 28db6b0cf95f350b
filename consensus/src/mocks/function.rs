use crate::{CallbackError, Function};
use bytes::Bytes;
use std::sync::Mutex;

/// How an [Oracle] reacts when executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Returns the configured message and signature.
    Honest,
    /// Reports it is not ready to run.
    Unready,
    /// Fails to execute.
    Fail,
    /// Panics while executing.
    Panic,
}

/// A recorded call to [Function::submit_multi_signed_message].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub context: Bytes,
    pub hash: Vec<u8>,
    pub signatures: Vec<Option<Bytes>>,
}

/// [Function] returning a fixed message and recording everything it is handed.
pub struct Oracle {
    message: Bytes,
    signature: Bytes,
    behavior: Mutex<Behavior>,

    mapped: Mutex<Vec<(Vec<u8>, Bytes)>>,
    submissions: Mutex<Vec<Submission>>,
}

impl Oracle {
    pub fn new(message: Bytes, signature: Bytes) -> Self {
        Self::with_behavior(message, signature, Behavior::Honest)
    }

    pub fn with_behavior(message: Bytes, signature: Bytes, behavior: Behavior) -> Self {
        Self {
            message,
            signature,
            behavior: Mutex::new(behavior),
            mapped: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Messages recorded with [Function::map_message], keyed by hash.
    pub fn mapped(&self) -> Vec<(Vec<u8>, Bytes)> {
        self.mapped.lock().unwrap().clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    fn behavior(&self) -> Behavior {
        *self.behavior.lock().unwrap()
    }
}

impl Function for Oracle {
    fn prepare_context(&self) -> Result<Option<Bytes>, CallbackError> {
        match self.behavior() {
            Behavior::Unready => Ok(None),
            _ => Ok(Some(Bytes::from_static(b"context"))),
        }
    }

    fn get_message_and_signature(&self, _: &[u8]) -> Result<(Bytes, Bytes), CallbackError> {
        match self.behavior() {
            Behavior::Honest | Behavior::Unready => {
                Ok((self.message.clone(), self.signature.clone()))
            }
            Behavior::Fail => Err("oracle unavailable".into()),
            Behavior::Panic => panic!("oracle panicked"),
        }
    }

    fn map_message(&self, _: &[u8], hash: &[u8], message: &[u8]) -> Result<(), CallbackError> {
        let mut mapped = self.mapped.lock().unwrap();
        if !mapped.iter().any(|(h, _)| h == hash) {
            mapped.push((hash.to_vec(), Bytes::copy_from_slice(message)));
        }
        Ok(())
    }

    fn submit_multi_signed_message(
        &self,
        context: &[u8],
        hash: &[u8],
        signatures: Vec<Option<Bytes>>,
    ) {
        self.submissions.lock().unwrap().push(Submission {
            context: Bytes::copy_from_slice(context),
            hash: hash.to_vec(),
            signatures,
        });
    }
}
