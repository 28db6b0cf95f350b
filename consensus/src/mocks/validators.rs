use crate::{types::ValidatorSet, Validators};
use commonware_cryptography::PublicKey;
use std::sync::{Arc, Mutex};

/// [Validators] returning whatever validator set was last configured.
#[derive(Clone)]
pub struct Static<P: PublicKey> {
    current: Arc<Mutex<Option<ValidatorSet<P>>>>,
}

impl<P: PublicKey> Static<P> {
    pub fn new(current: Option<ValidatorSet<P>>) -> Self {
        Self {
            current: Arc::new(Mutex::new(current)),
        }
    }

    /// Replace the validator set returned to all clones.
    pub fn set(&self, current: Option<ValidatorSet<P>>) {
        *self.current.lock().unwrap() = current;
    }
}

impl<P: PublicKey> Validators for Static<P> {
    type PublicKey = P;

    async fn current(&mut self) -> Option<ValidatorSet<P>> {
        self.current.lock().unwrap().clone()
    }
}
