//! Durable state of the reactor.

use crate::{
    types::{read_string, string_size, write_string, ValidatorSet, VoteSet, MAX_ID_LENGTH},
    Store,
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    DecodeExt, Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write,
};
use commonware_cryptography::PublicKey;
use std::{collections::BTreeMap, error::Error as StdError};
use thiserror::Error;
use tracing::debug;

/// Key the reactor state is persisted under.
pub const STATE_KEY: &[u8] = b"fnConsensusReactor:state";

/// Maximum number of functions tracked in the persisted state.
pub const MAX_FUNCTIONS: usize = 1024;

/// Nonce of a function that has never converged.
pub const INITIAL_NONCE: u64 = 1;

/// Errors that can occur when loading or saving the reactor state.
#[derive(Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[source] Box<dyn StdError + Send + Sync>),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Everything the reactor needs to resume after a restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorState<P: PublicKey> {
    /// In-flight vote set per function.
    pub current_vote_sets: BTreeMap<String, VoteSet<P>>,
    /// Next nonce to agree on per function.
    pub current_nonces: BTreeMap<String, u64>,
    /// Most recent converged vote set per function.
    pub previous_maj_vote_sets: BTreeMap<String, VoteSet<P>>,
    /// Validator set the most recent converged vote sets were built for.
    pub previous_validator_set: Option<ValidatorSet<P>>,
}

impl<P: PublicKey> Default for ReactorState<P> {
    fn default() -> Self {
        Self {
            current_vote_sets: BTreeMap::new(),
            current_nonces: BTreeMap::new(),
            previous_maj_vote_sets: BTreeMap::new(),
            previous_validator_set: None,
        }
    }
}

impl<P: PublicKey> ReactorState<P> {
    /// Returns the next nonce to agree on for `fn_id`.
    pub fn nonce(&self, fn_id: &str) -> u64 {
        self.current_nonces
            .get(fn_id)
            .copied()
            .unwrap_or(INITIAL_NONCE)
    }

    /// Load the state from `store`, starting fresh if nothing was persisted.
    pub async fn load<S: Store>(store: &mut S) -> Result<Self, Error> {
        let Some(raw) = store
            .get(STATE_KEY)
            .await
            .map_err(|err| Error::Store(Box::new(err)))?
        else {
            debug!("no persisted state found");
            return Ok(Self::default());
        };
        Ok(Self::decode(raw)?)
    }

    /// Persist the state to `store`.
    pub async fn save<S: Store>(&self, store: &mut S) -> Result<(), Error> {
        store
            .put(STATE_KEY, self.encode().freeze())
            .await
            .map_err(|err| Error::Store(Box::new(err)))
    }
}

fn write_vote_sets<P: PublicKey>(vote_sets: &BTreeMap<String, VoteSet<P>>, buf: &mut impl BufMut) {
    (vote_sets.len() as u32).write(buf);
    for (fn_id, vote_set) in vote_sets {
        write_string(fn_id, buf);
        vote_set.write(buf);
    }
}

fn vote_sets_size<P: PublicKey>(vote_sets: &BTreeMap<String, VoteSet<P>>) -> usize {
    (vote_sets.len() as u32).encode_size()
        + vote_sets
            .iter()
            .map(|(fn_id, vote_set)| string_size(fn_id) + vote_set.encode_size())
            .sum::<usize>()
}

fn read_len(buf: &mut impl Buf) -> Result<usize, CodecError> {
    let len = u32::read(buf)? as usize;
    if len > MAX_FUNCTIONS {
        return Err(CodecError::Invalid("ReactorState", "too many functions"));
    }
    Ok(len)
}

fn read_fn_id(buf: &mut impl Buf) -> Result<String, CodecError> {
    read_string(buf, MAX_ID_LENGTH, "ReactorState")
}

fn read_vote_sets<P: PublicKey>(
    buf: &mut impl Buf,
) -> Result<BTreeMap<String, VoteSet<P>>, CodecError> {
    let len = read_len(buf)?;
    let mut vote_sets = BTreeMap::new();
    for _ in 0..len {
        let fn_id = read_fn_id(buf)?;
        let vote_set = VoteSet::read(buf)?;
        if vote_sets.insert(fn_id, vote_set).is_some() {
            return Err(CodecError::Invalid("ReactorState", "duplicate function"));
        }
    }
    Ok(vote_sets)
}

impl<P: PublicKey> Write for ReactorState<P> {
    fn write(&self, buf: &mut impl BufMut) {
        write_vote_sets(&self.current_vote_sets, buf);
        (self.current_nonces.len() as u32).write(buf);
        for (fn_id, nonce) in &self.current_nonces {
            write_string(fn_id, buf);
            nonce.write(buf);
        }
        write_vote_sets(&self.previous_maj_vote_sets, buf);
        self.previous_validator_set.write(buf);
    }
}

impl<P: PublicKey> EncodeSize for ReactorState<P> {
    fn encode_size(&self) -> usize {
        vote_sets_size(&self.current_vote_sets)
            + (self.current_nonces.len() as u32).encode_size()
            + self
                .current_nonces
                .iter()
                .map(|(fn_id, nonce)| string_size(fn_id) + nonce.encode_size())
                .sum::<usize>()
            + vote_sets_size(&self.previous_maj_vote_sets)
            + self.previous_validator_set.encode_size()
    }
}

impl<P: PublicKey> Read for ReactorState<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let current_vote_sets = read_vote_sets(buf)?;
        let len = read_len(buf)?;
        let mut current_nonces = BTreeMap::new();
        for _ in 0..len {
            let fn_id = read_fn_id(buf)?;
            let nonce = u64::read(buf)?;
            if current_nonces.insert(fn_id, nonce).is_some() {
                return Err(CodecError::Invalid("ReactorState", "duplicate function"));
            }
        }
        let previous_maj_vote_sets = read_vote_sets(buf)?;
        let previous_validator_set = Option::<ValidatorSet<P>>::read(buf)?;
        Ok(Self {
            current_vote_sets,
            current_nonces,
            previous_maj_vote_sets,
            previous_validator_set,
        })
    }
}
