//! Agree on the output of off-chain functions using the voting power of a host validator set.
//!
//! Validators periodically execute every registered [Function], sign the result, and gossip
//! a [types::VoteSet] over a pair of channels. Vote sets are merged as they spread and, once
//! enough voting power agrees on the same output, one validator (chosen round-robin among the
//! agreeing validators) submits the collected signatures. The nonce of the function then
//! advances and the converged vote set is kept around so lagging peers can catch up.
//!
//! # Status
//!
//! `fn-consensus` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use bytes::Bytes;
use commonware_cryptography::PublicKey;
use std::{error::Error as StdError, future::Future};

pub mod reactor;
pub mod registry;
pub mod settings;
pub mod state;
pub mod types;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

/// Error returned by a [Function] callback.
pub type CallbackError = Box<dyn StdError + Send + Sync>;

/// Function is the interface implemented by the off-chain logic (oracles, bridges, ...) that
/// validators reach agreement on.
///
/// Callbacks are invoked synchronously from the reactor and are expected to return promptly.
/// A callback that panics is skipped for the round; it never takes the reactor down.
pub trait Function: Send + Sync + 'static {
    /// Prepare the execution context for the next round.
    ///
    /// Returning `None` indicates the function is not ready and should be skipped.
    fn prepare_context(&self) -> Result<Option<Bytes>, CallbackError>;

    /// Execute the function in the given context, returning the message to agree on and
    /// this validator's (function-specific) signature over it.
    fn get_message_and_signature(&self, context: &[u8]) -> Result<(Bytes, Bytes), CallbackError>;

    /// Record the message behind a hash so it can be recovered at submission time.
    fn map_message(&self, context: &[u8], hash: &[u8], message: &[u8])
        -> Result<(), CallbackError>;

    /// Submit the signatures collected for the message identified by `hash`.
    ///
    /// `signatures` is indexed by validator index and is `None` for validators that did not
    /// agree.
    fn submit_multi_signed_message(
        &self,
        context: &[u8],
        hash: &[u8],
        signatures: Vec<Option<Bytes>>,
    );
}

/// Validators is the source of truth for the validator set of the host chain.
pub trait Validators: Clone + Send + 'static {
    /// Public key type used to identify validators.
    type PublicKey: PublicKey;

    /// Returns the current validator set, or `None` if host-chain state is not yet available.
    fn current(
        &mut self,
    ) -> impl Future<Output = Option<types::ValidatorSet<Self::PublicKey>>> + Send;
}

/// Store is the durable key-value store the reactor persists its state to.
pub trait Store: Clone + Send + 'static {
    /// Error that can occur when accessing the store.
    type Error: StdError + Send + Sync + 'static;

    /// Get the value stored at `key`, if any.
    fn get(&mut self, key: &[u8]) -> impl Future<Output = Result<Option<Bytes>, Self::Error>> + Send;

    /// Durably store `value` at `key`.
    fn put(&mut self, key: &[u8], value: Bytes)
        -> impl Future<Output = Result<(), Self::Error>> + Send;
}
