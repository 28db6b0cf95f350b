//! Types used to reach agreement on the output of a [crate::Function].

use crate::registry::Registry;
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{
    Encode, EncodeSize, Error as CodecError, Read, ReadExt, ReadRangeExt, Write,
};
use commonware_cryptography::{
    sha256::{Digest, Sha256},
    Hasher, PublicKey, Signer,
};
use commonware_utils::{hex, BitVec};
use std::{
    cmp::Ordering,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

/// Namespace for signatures over vote sets.
pub const NAMESPACE: &[u8] = b"_FN_CONSENSUS_VOTE";

/// Maximum number of validators a vote set can refer to.
pub const MAX_VALIDATORS: usize = 1024;

/// Maximum length of function IDs, chain IDs and vote set IDs.
pub const MAX_ID_LENGTH: usize = 128;

/// Maximum length of the error carried in a response.
pub const MAX_ERROR_LENGTH: usize = 1024;

/// Maximum length of a function-specific (oracle) signature.
pub const MAX_ORACLE_SIGNATURE_LENGTH: usize = 1024;

/// Maximum length of an execution context accepted by the codec.
///
/// The reactor enforces a (much) smaller configurable limit during validation.
pub const MAX_EXECUTION_CONTEXT_LENGTH: usize = 64 * 1024;

/// Status of a successful execution.
pub const STATUS_OK: u8 = 0;

/// Status of a failed execution.
pub const STATUS_FAILED: u8 = 1;

/// Errors that can occur when building, validating or merging vote sets.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    // Validator set
    /// The validator index is out of range
    #[error("invalid validator index: {0}")]
    InvalidIndex(usize),
    /// The validator has no voting power
    #[error("validator {0} has no voting power")]
    ZeroVotingPower(usize),
    /// The override validator is not part of the host validator set
    #[error("override validator not found in validator set: {0}")]
    UnknownOverride(String),

    // Payload
    /// The response does not have one entry per validator
    #[error("response has {0} entries but validator set has {1}")]
    ResponseSizeMismatch(usize, usize),
    /// The response signature bit and the oracle signature disagree
    #[error("response signature mismatch at index {0}")]
    ResponseSignatureMismatch(usize),
    /// The function is not registered
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    // Vote set
    /// The chain ID does not match
    #[error("chain id mismatch")]
    ChainIdMismatch,
    /// The vote set is older than its validity period
    #[error("vote set expired")]
    Expired,
    /// The vote set was built for a different validator set
    #[error("validators hash mismatch")]
    ValidatorsHashMismatch,
    /// A per-validator array does not have one entry per validator
    #[error("array length mismatch")]
    LengthMismatch,
    /// The execution context exceeds the configured limit
    #[error("execution context too large: {0}")]
    ContextTooLarge(usize),
    /// The validator address does not match the validator set
    #[error("invalid validator address at index {0}")]
    InvalidValidatorAddress(usize),
    /// The vote bit and the signature bit disagree
    #[error("vote mismatch at index {0}")]
    VoteMismatch(usize),
    /// An agree vote is missing its oracle signature
    #[error("missing oracle signature at index {0}")]
    MissingOracleSignature(usize),
    /// A disagree vote carries an oracle signature
    #[error("unexpected oracle signature at index {0}")]
    UnexpectedOracleSignature(usize),
    /// A vote is missing its signature
    #[error("missing signature at index {0}")]
    MissingSignature(usize),
    /// A vote signature does not verify
    #[error("invalid signature at index {0}")]
    InvalidSignature(usize),
    /// The declared agree voting power does not match the votes
    #[error("agree voting power mismatch: declared {0}, computed {1}")]
    AgreePowerMismatch(u64, u64),
    /// The declared disagree voting power does not match the votes
    #[error("disagree voting power mismatch: declared {0}, computed {1}")]
    DisagreePowerMismatch(u64, u64),

    /// The vote set has not reached the signing threshold
    #[error("vote set has not converged")]
    NotConverged,

    // Merge
    /// The vote sets do not refer to the same payload
    #[error("merging is not allowed, as fn votes have different payload")]
    MergeDiffPayload,
    /// The response already holds a signature for this validator
    #[error("response signature already present at index {0}")]
    SignatureAlreadyPresent(usize),
    /// The validator already voted
    #[error("vote already cast at index {0}")]
    VoteAlreadyCast(usize),
    /// The vote targets another nonce
    #[error("nonce mismatch: expected {0}, found {1}")]
    NonceMismatch(u64, u64),
}

/// Writes a length-prefixed UTF-8 string.
pub(crate) fn write_string(value: &str, buf: &mut impl BufMut) {
    value.len().write(buf);
    buf.put_slice(value.as_bytes());
}

/// Returns the encoded size of a string written with [write_string].
pub(crate) fn string_size(value: &str) -> usize {
    value.len().encode_size() + value.len()
}

/// Reads a length-bounded UTF-8 string.
pub(crate) fn read_string(
    buf: &mut impl Buf,
    max: usize,
    context: &'static str,
) -> Result<String, CodecError> {
    let bytes = Vec::<u8>::read_range(buf, ..=max)?;
    String::from_utf8(bytes).map_err(|_| CodecError::Invalid(context, "invalid UTF-8"))
}

/// Hash a message with SHA-256.
pub fn hash(message: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(message);
    hasher.finalize()
}

/// A validator and its voting power.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validator<P: PublicKey> {
    pub public_key: P,
    pub voting_power: u64,
}

impl<P: PublicKey> Write for Validator<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.public_key.write(buf);
        self.voting_power.write(buf);
    }
}

impl<P: PublicKey> EncodeSize for Validator<P> {
    fn encode_size(&self) -> usize {
        self.public_key.encode_size() + self.voting_power.encode_size()
    }
}

impl<P: PublicKey> Read for Validator<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let public_key = P::read(buf)?;
        let voting_power = u64::read(buf)?;
        Ok(Self {
            public_key,
            voting_power,
        })
    }
}

/// An ordered snapshot of the validators of the host chain.
///
/// Every per-validator array of a [VoteSet] is indexed by the position of the validator
/// in this ordering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorSet<P: PublicKey> {
    validators: Vec<Validator<P>>,
    total_voting_power: u64,
    hash: Digest,
}

impl<P: PublicKey> ValidatorSet<P> {
    /// Create a new validator set with the given ordering.
    pub fn new(validators: Vec<Validator<P>>) -> Self {
        let total_voting_power = validators.iter().map(|v| v.voting_power).sum();
        let hash = hash(&validators.encode());
        Self {
            validators,
            total_voting_power,
            hash,
        }
    }

    /// Build a static validator set from the listed validators (in the given order), replacing
    /// their voting power with the given one.
    ///
    /// Every listed validator must be part of `self`.
    pub fn with_overrides(&self, overrides: &[(P, u64)]) -> Result<Self, Error> {
        let mut validators = Vec::with_capacity(overrides.len());
        for (public_key, voting_power) in overrides {
            if self.index_of(public_key).is_none() {
                return Err(Error::UnknownOverride(public_key.to_string()));
            }
            validators.push(Validator {
                public_key: public_key.clone(),
                voting_power: *voting_power,
            });
        }
        Ok(Self::new(validators))
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Validator<P>> {
        self.validators.get(index)
    }

    /// Returns the index of `public_key` in the validator set.
    pub fn index_of(&self, public_key: &P) -> Option<usize> {
        self.validators
            .iter()
            .position(|v| &v.public_key == public_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator<P>> {
        self.validators.iter()
    }

    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    /// Hash of the encoded validator list.
    pub fn hash(&self) -> &Digest {
        &self.hash
    }
}

impl<P: PublicKey> Write for ValidatorSet<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.validators.write(buf);
    }
}

impl<P: PublicKey> EncodeSize for ValidatorSet<P> {
    fn encode_size(&self) -> usize {
        self.validators.encode_size()
    }
}

impl<P: PublicKey> Read for ValidatorSet<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let validators = Vec::<Validator<P>>::read_range(buf, ..=MAX_VALIDATORS)?;
        Ok(Self::new(validators))
    }
}

/// Voting power required for a vote set to converge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SigningThreshold {
    /// Every validator must vote the same way.
    All,
    /// More than two-thirds of the voting power must vote the same way.
    #[default]
    Maj23,
}

impl SigningThreshold {
    /// Returns whether `power` out of `total` reaches the threshold.
    pub fn reached(&self, power: u64, total: u64) -> bool {
        match self {
            Self::All => power == total,
            Self::Maj23 => power >= total * 2 / 3 + 1,
        }
    }
}

impl fmt::Display for SigningThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Maj23 => write!(f, "Maj23"),
        }
    }
}

/// Whether a validator agrees with the response carried by a vote set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteType {
    Agree,
    Disagree,
}

impl VoteType {
    fn from_bit(bit: bool) -> Self {
        if bit {
            Self::Agree
        } else {
            Self::Disagree
        }
    }

    fn as_u8(&self) -> u8 {
        match self {
            Self::Agree => 1,
            Self::Disagree => 0,
        }
    }
}

/// Identifies the [crate::Function] a vote set concerns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub fn_id: String,
}

impl Request {
    /// Create a request for a registered function.
    pub fn new(fn_id: impl Into<String>, registry: &Registry) -> Result<Self, Error> {
        let fn_id = fn_id.into();
        if registry.get(&fn_id).is_none() {
            return Err(Error::UnknownFunction(fn_id));
        }
        Ok(Self { fn_id })
    }

    pub fn canonical_compare(&self, other: &Self) -> bool {
        self.fn_id == other.fn_id
    }
}

impl Write for Request {
    fn write(&self, buf: &mut impl BufMut) {
        write_string(&self.fn_id, buf);
    }
}

impl EncodeSize for Request {
    fn encode_size(&self) -> usize {
        string_size(&self.fn_id)
    }
}

impl Read for Request {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let fn_id = read_string(buf, MAX_ID_LENGTH, "Request")?;
        Ok(Self { fn_id })
    }
}

/// The output of a single validator's execution of a function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndividualResponse {
    pub status: u8,
    pub error: Bytes,
    pub hash: Digest,
    pub oracle_signature: Option<Bytes>,
}

impl IndividualResponse {
    /// A successful execution producing a message with the given hash.
    pub fn success(hash: Digest, oracle_signature: Bytes) -> Self {
        Self {
            status: STATUS_OK,
            error: Bytes::new(),
            hash,
            oracle_signature: Some(oracle_signature),
        }
    }

    /// A failed execution.
    pub fn failure(error: &str) -> Self {
        let error = error.as_bytes();
        let error = &error[..error.len().min(MAX_ERROR_LENGTH)];
        Self {
            status: STATUS_FAILED,
            error: Bytes::copy_from_slice(error),
            hash: Digest::from([0u8; 32]),
            oracle_signature: None,
        }
    }
}

/// Agreeing signatures collected for a response once the signing threshold is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateResponse {
    pub hash: Digest,
    pub signatures: BitVec,
    pub oracle_signatures: Vec<Option<Bytes>>,
}

impl AggregateResponse {
    pub fn number_of_agree_votes(&self) -> usize {
        self.signatures.count_ones()
    }

    /// Rank of `index` among the agreeing validators (ordered by index).
    ///
    /// Returns `None` if the validator at `index` did not agree.
    pub fn agree_index(&self, index: usize) -> Option<usize> {
        if !self.signatures.get(index).unwrap_or(false) {
            return None;
        }
        Some(self.signatures.iter().take(index).filter(|bit| *bit).count())
    }
}

/// A response aggregated across the validator set.
///
/// `signatures[i]` is set iff `oracle_signatures[i]` is present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub error: Bytes,
    pub hash: Digest,
    pub signatures: BitVec,
    pub oracle_signatures: Vec<Option<Bytes>>,
}

impl Response {
    /// Create a response for a validator set of `size`, seeded with the individual response
    /// of the validator at `index`.
    pub fn new(individual: IndividualResponse, index: usize, size: usize) -> Result<Self, Error> {
        if index >= size {
            return Err(Error::InvalidIndex(index));
        }
        let mut signatures = BitVec::zeroes(size);
        let mut oracle_signatures = vec![None; size];
        if let Some(signature) = individual.oracle_signature {
            signatures.set(index);
            oracle_signatures[index] = Some(signature);
        }
        Ok(Self {
            status: individual.status,
            error: individual.error,
            hash: individual.hash,
            signatures,
            oracle_signatures,
        })
    }

    /// Checks the response is consistent for a validator set of `size`.
    pub fn is_valid(&self, size: usize) -> Result<(), Error> {
        if self.signatures.len() != size {
            return Err(Error::ResponseSizeMismatch(self.signatures.len(), size));
        }
        if self.oracle_signatures.len() != size {
            return Err(Error::ResponseSizeMismatch(self.oracle_signatures.len(), size));
        }
        for (i, signature) in self.oracle_signatures.iter().enumerate() {
            if self.signatures.get(i) != Some(signature.is_some()) {
                return Err(Error::ResponseSignatureMismatch(i));
            }
        }
        Ok(())
    }

    /// Returns whether `individual` produced the same output as this response.
    pub fn agrees_with(&self, individual: &IndividualResponse) -> bool {
        self.status == individual.status
            && self.error == individual.error
            && self.hash == individual.hash
    }

    /// Compares everything but the signatures.
    pub fn canonical_compare(&self, other: &Self) -> bool {
        self.status == other.status
            && self.error == other.error
            && self.hash == other.hash
            && self.signatures.len() == other.signatures.len()
            && self.oracle_signatures.len() == other.oracle_signatures.len()
    }

    /// Compares everything, including the signatures.
    pub fn compare(&self, other: &Self) -> bool {
        self.canonical_compare(other)
            && self.signatures == other.signatures
            && self.oracle_signatures == other.oracle_signatures
    }

    /// Add the oracle signature of the validator at `index`.
    pub fn add_signature(&mut self, index: usize, signature: Bytes) -> Result<(), Error> {
        match self.signatures.get(index) {
            None => Err(Error::InvalidIndex(index)),
            Some(true) => Err(Error::SignatureAlreadyPresent(index)),
            Some(false) => {
                self.signatures.set(index);
                self.oracle_signatures[index] = Some(signature);
                Ok(())
            }
        }
    }

    /// Copy the signature at `index` from `other` if `self` does not have one.
    fn adopt(&mut self, other: &Self, index: usize) -> bool {
        if self.signatures.get(index) != Some(false) || other.signatures.get(index) != Some(true)
        {
            return false;
        }
        self.signatures.set(index);
        self.oracle_signatures[index] = other.oracle_signatures[index].clone();
        true
    }

    /// Union the signatures of `other` into `self`, returning whether anything changed.
    pub fn merge(&mut self, other: &Self) -> Result<bool, Error> {
        if !self.canonical_compare(other) {
            return Err(Error::MergeDiffPayload);
        }
        let mut changed = false;
        for i in 0..self.signatures.len() {
            changed |= self.adopt(other, i);
        }
        Ok(changed)
    }

    /// Bytes signed by the validator at `index`.
    pub fn sign_bytes(&self, index: usize) -> Vec<u8> {
        let oracle_signature = self.oracle_signatures.get(index).cloned().flatten();
        let mut buf = Vec::with_capacity(
            self.status.encode_size()
                + self.error.encode_size()
                + self.hash.encode_size()
                + oracle_signature.encode_size(),
        );
        self.status.write(&mut buf);
        self.error.write(&mut buf);
        self.hash.write(&mut buf);
        oracle_signature.write(&mut buf);
        buf
    }

    /// Returns the agreeing signatures if they carry enough voting power.
    pub fn to_aggregate<P: PublicKey>(
        &self,
        threshold: SigningThreshold,
        validators: &ValidatorSet<P>,
    ) -> Option<AggregateResponse> {
        let power: u64 = self
            .signatures
            .iter()
            .enumerate()
            .filter(|(_, bit)| *bit)
            .filter_map(|(i, _)| validators.get(i))
            .map(|v| v.voting_power)
            .sum();
        if !threshold.reached(power, validators.total_voting_power()) {
            return None;
        }
        Some(AggregateResponse {
            hash: self.hash,
            signatures: self.signatures.clone(),
            oracle_signatures: self.oracle_signatures.clone(),
        })
    }
}

impl Write for Response {
    fn write(&self, buf: &mut impl BufMut) {
        self.status.write(buf);
        self.error.write(buf);
        self.hash.write(buf);
        self.signatures.write(buf);
        self.oracle_signatures.write(buf);
    }
}

impl EncodeSize for Response {
    fn encode_size(&self) -> usize {
        self.status.encode_size()
            + self.error.encode_size()
            + self.hash.encode_size()
            + self.signatures.encode_size()
            + self.oracle_signatures.encode_size()
    }
}

impl Read for Response {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let status = u8::read(buf)?;
        let error = Bytes::read_cfg(buf, &(..=MAX_ERROR_LENGTH).into())?;
        let hash = Digest::read(buf)?;
        let signatures = BitVec::read_cfg(buf, &(..=MAX_VALIDATORS).into())?;
        let oracle_signatures = Vec::<Option<Bytes>>::read_cfg(
            buf,
            &(
                (..=MAX_VALIDATORS).into(),
                (..=MAX_ORACLE_SIGNATURE_LENGTH).into(),
            ),
        )?;
        if signatures.len() != oracle_signatures.len() {
            return Err(CodecError::Invalid("Response", "length mismatch"));
        }
        Ok(Self {
            status,
            error,
            hash,
            signatures,
            oracle_signatures,
        })
    }
}

/// The request and response a vote set is about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub request: Request,
    pub response: Response,
}

impl Payload {
    pub fn new(request: Request, response: Response) -> Self {
        Self { request, response }
    }

    pub fn is_valid(&self, size: usize) -> Result<(), Error> {
        self.response.is_valid(size)
    }

    /// Returns whether two payloads can be merged.
    pub fn canonical_compare(&self, other: &Self) -> bool {
        self.request.canonical_compare(&other.request)
            && self.response.canonical_compare(&other.response)
    }

    pub fn compare(&self, other: &Self) -> bool {
        self.request.canonical_compare(&other.request) && self.response.compare(&other.response)
    }

    pub fn merge(&mut self, other: &Self) -> Result<bool, Error> {
        if !self.request.canonical_compare(&other.request) {
            return Err(Error::MergeDiffPayload);
        }
        self.response.merge(&other.response)
    }

    /// Bytes signed by the validator at `index`.
    pub fn sign_bytes(&self, index: usize) -> Vec<u8> {
        let mut buf = self.request.encode().to_vec();
        buf.extend_from_slice(&self.response.sign_bytes(index));
        buf
    }
}

impl Write for Payload {
    fn write(&self, buf: &mut impl BufMut) {
        self.request.write(buf);
        self.response.write(buf);
    }
}

impl EncodeSize for Payload {
    fn encode_size(&self) -> usize {
        self.request.encode_size() + self.response.encode_size()
    }
}

impl Read for Payload {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let request = Request::read(buf)?;
        let response = Response::read(buf)?;
        Ok(Self { request, response })
    }
}

/// The gossiped, partially signed record of the validators' votes on the output of one
/// function at one nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteSet<P: PublicKey> {
    /// Round identifier derived from the chain, function, nonce and creation time.
    pub id: String,
    pub nonce: u64,
    pub validators_hash: Digest,
    pub chain_id: String,
    pub total_agree_voting_power: u64,
    pub total_disagree_voting_power: u64,
    /// Start of the round the vote set was proposed in (seconds since the unix epoch).
    pub creation_time: u64,
    pub votes: BitVec,
    /// Set where the vote is an agree vote (only meaningful where `votes` is set).
    pub vote_types: BitVec,
    pub payload: Payload,
    pub execution_context: Bytes,
    pub validator_signatures: Vec<Option<P::Signature>>,
    pub validator_addresses: Vec<P>,
}

impl<P: PublicKey> VoteSet<P> {
    /// Derive the identifier of the round proposing `nonce` of `fn_id` at `creation_time`.
    ///
    /// Validators proposing in the same round derive the same identifier, which allows their
    /// vote sets to be merged.
    pub fn identifier(chain_id: &str, fn_id: &str, nonce: u64, creation_time: u64) -> String {
        let mut buf = Vec::with_capacity(string_size(chain_id) + string_size(fn_id));
        write_string(chain_id, &mut buf);
        write_string(fn_id, &mut buf);
        let mut hasher = Sha256::new();
        hasher.update(&buf);
        hasher.update(&nonce.to_be_bytes());
        hasher.update(&creation_time.to_be_bytes());
        hex(hasher.finalize().as_ref())
    }

    /// Create a vote set carrying the (agree) vote of the proposer at `proposer`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<C>(
        nonce: u64,
        chain_id: &str,
        creation_time: u64,
        proposer: usize,
        execution_context: Bytes,
        payload: Payload,
        signer: &C,
        validators: &ValidatorSet<P>,
    ) -> Result<Self, Error>
    where
        C: Signer<PublicKey = P, Signature = P::Signature>,
    {
        payload.is_valid(validators.len())?;
        let validator = validators
            .get(proposer)
            .ok_or(Error::InvalidIndex(proposer))?;
        if validator.voting_power == 0 {
            return Err(Error::ZeroVotingPower(proposer));
        }
        if !payload.response.signatures.get(proposer).unwrap_or(false) {
            return Err(Error::MissingOracleSignature(proposer));
        }

        let size = validators.len();
        let mut votes = BitVec::zeroes(size);
        votes.set(proposer);
        let vote_types = votes.clone();
        let mut vote_set = Self {
            id: Self::identifier(chain_id, &payload.request.fn_id, nonce, creation_time),
            nonce,
            validators_hash: *validators.hash(),
            chain_id: chain_id.to_string(),
            total_agree_voting_power: validator.voting_power,
            total_disagree_voting_power: 0,
            creation_time,
            votes,
            vote_types,
            payload,
            execution_context,
            validator_signatures: vec![None; size],
            validator_addresses: validators.iter().map(|v| v.public_key.clone()).collect(),
        };
        let message = vote_set.sign_bytes(proposer, VoteType::Agree);
        vote_set.validator_signatures[proposer] = Some(signer.sign(Some(NAMESPACE), &message));
        Ok(vote_set)
    }

    pub fn fn_id(&self) -> &str {
        &self.payload.request.fn_id
    }

    pub fn number_of_votes(&self) -> usize {
        self.votes.count_ones()
    }

    /// Returns whether the validator at `index` has voted.
    pub fn has_signed(&self, index: usize) -> bool {
        self.votes.get(index).unwrap_or(false)
    }

    /// Returns the vote of the validator at `index`, if any.
    pub fn vote_type(&self, index: usize) -> Option<VoteType> {
        if !self.has_signed(index) {
            return None;
        }
        self.vote_types.get(index).map(VoteType::from_bit)
    }

    /// Addresses of the validators that have voted.
    pub fn active_validators(&self) -> Vec<&P> {
        self.votes
            .iter()
            .zip(self.validator_addresses.iter())
            .filter(|(voted, _)| *voted)
            .map(|(_, address)| address)
            .collect()
    }

    /// Bytes signed by the validator at `index` when casting a vote of `vote_type`.
    pub fn sign_bytes(&self, index: usize, vote_type: VoteType) -> Vec<u8> {
        let mut buf = Vec::new();
        write_string(&self.id, &mut buf);
        self.nonce.write(&mut buf);
        self.creation_time.write(&mut buf);
        write_string(&self.chain_id, &mut buf);
        self.validator_addresses.get(index).cloned().write(&mut buf);
        vote_type.as_u8().write(&mut buf);
        self.execution_context.write(&mut buf);
        self.validators_hash.write(&mut buf);
        buf.extend_from_slice(&self.payload.sign_bytes(index));
        buf
    }

    /// Verify the vote of the validator at `index` against `public_key`.
    pub fn verify_signature(&self, index: usize, public_key: &P) -> Result<(), Error> {
        let vote_type = self.vote_type(index).ok_or(Error::VoteMismatch(index))?;
        if self.validator_addresses.get(index) != Some(public_key) {
            return Err(Error::InvalidValidatorAddress(index));
        }
        let signature = self
            .validator_signatures
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or(Error::MissingSignature(index))?;
        let message = self.sign_bytes(index, vote_type);
        if !public_key.verify(Some(NAMESPACE), &message, signature) {
            return Err(Error::InvalidSignature(index));
        }
        Ok(())
    }

    /// Returns whether the vote set is older than `validity` at `now`.
    pub fn is_expired(&self, validity: Duration, now: SystemTime) -> bool {
        let now = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        Duration::from_secs(self.creation_time).saturating_add(validity) <= now
    }

    /// Checks a vote set received from a peer before acting on it.
    ///
    /// Fails on the first inconsistency: there is no partial acceptance.
    pub fn is_valid(
        &self,
        chain_id: &str,
        max_context_size: usize,
        validity: Duration,
        now: SystemTime,
        validators: &ValidatorSet<P>,
        registry: &Registry,
    ) -> Result<(), Error> {
        let size = validators.len();
        self.payload.is_valid(size)?;
        if registry.get(self.fn_id()).is_none() {
            return Err(Error::UnknownFunction(self.fn_id().to_string()));
        }
        if self.chain_id != chain_id {
            return Err(Error::ChainIdMismatch);
        }
        if self.is_expired(validity, now) {
            return Err(Error::Expired);
        }
        if &self.validators_hash != validators.hash() {
            return Err(Error::ValidatorsHashMismatch);
        }
        if self.votes.len() != size
            || self.vote_types.len() != size
            || self.validator_signatures.len() != size
            || self.validator_addresses.len() != size
        {
            return Err(Error::LengthMismatch);
        }
        if self.execution_context.len() > max_context_size {
            return Err(Error::ContextTooLarge(self.execution_context.len()));
        }

        let response = &self.payload.response;
        let mut agree = 0u64;
        let mut disagree = 0u64;
        for (i, validator) in validators.iter().enumerate() {
            if self.validator_addresses[i] != validator.public_key {
                return Err(Error::InvalidValidatorAddress(i));
            }
            let signed = response.signatures.get(i).unwrap_or(false);
            let Some(vote_type) = self.vote_type(i) else {
                if signed || self.validator_signatures[i].is_some() {
                    return Err(Error::VoteMismatch(i));
                }
                continue;
            };
            match vote_type {
                VoteType::Agree => {
                    if !signed {
                        return Err(Error::MissingOracleSignature(i));
                    }
                    agree += validator.voting_power;
                }
                VoteType::Disagree => {
                    if signed {
                        return Err(Error::UnexpectedOracleSignature(i));
                    }
                    disagree += validator.voting_power;
                }
            }
            self.verify_signature(i, &validator.public_key)?;
        }
        if agree != self.total_agree_voting_power {
            return Err(Error::AgreePowerMismatch(
                self.total_agree_voting_power,
                agree,
            ));
        }
        if disagree != self.total_disagree_voting_power {
            return Err(Error::DisagreePowerMismatch(
                self.total_disagree_voting_power,
                disagree,
            ));
        }
        Ok(())
    }

    /// Returns whether two vote sets describe the same round and payload (ignoring votes).
    pub fn canonical_compare(&self, other: &Self) -> bool {
        self.id == other.id
            && self.nonce == other.nonce
            && self.chain_id == other.chain_id
            && self.validators_hash == other.validators_hash
            && self.creation_time == other.creation_time
            && self.execution_context == other.execution_context
            && self.payload.canonical_compare(&other.payload)
            && self.votes.len() == other.votes.len()
            && self.vote_types.len() == other.vote_types.len()
            && self.validator_signatures.len() == other.validator_signatures.len()
            && self.validator_addresses == other.validator_addresses
    }

    /// Union the votes of `other` into `self`, returning whether anything changed.
    ///
    /// Votes already present in `self` are never overwritten.
    pub fn merge(&mut self, validators: &ValidatorSet<P>, other: &Self) -> Result<bool, Error> {
        if !self.canonical_compare(other) {
            return Err(Error::MergeDiffPayload);
        }
        let mut changed = false;
        for i in 0..self.votes.len() {
            if self.has_signed(i) {
                continue;
            }
            let Some(vote_type) = other.vote_type(i) else {
                continue;
            };
            let validator = validators.get(i).ok_or(Error::InvalidIndex(i))?;
            self.payload.response.adopt(&other.payload.response, i);
            self.validator_signatures[i] = other.validator_signatures[i].clone();
            self.validator_addresses[i] = other.validator_addresses[i].clone();
            self.votes.set(i);
            match vote_type {
                VoteType::Agree => {
                    self.vote_types.set(i);
                    self.total_agree_voting_power += validator.voting_power;
                }
                VoteType::Disagree => {
                    self.total_disagree_voting_power += validator.voting_power;
                }
            }
            changed = true;
        }
        Ok(changed)
    }

    /// Cast the vote of the validator at `index` given its own execution of the function.
    ///
    /// The vote is an agree vote iff the execution produced the same output as the response
    /// carried by the vote set.
    pub fn add_vote<C>(
        &mut self,
        nonce: u64,
        individual: IndividualResponse,
        validators: &ValidatorSet<P>,
        index: usize,
        signer: &C,
    ) -> Result<VoteType, Error>
    where
        C: Signer<PublicKey = P, Signature = P::Signature>,
    {
        if self.nonce != nonce {
            return Err(Error::NonceMismatch(self.nonce, nonce));
        }
        if self.has_signed(index) {
            return Err(Error::VoteAlreadyCast(index));
        }
        let validator = validators.get(index).ok_or(Error::InvalidIndex(index))?;
        if self.validator_addresses.get(index) != Some(&validator.public_key) {
            return Err(Error::InvalidValidatorAddress(index));
        }

        let vote_type = match individual.oracle_signature.clone() {
            Some(signature) if self.payload.response.agrees_with(&individual) => {
                self.payload.response.add_signature(index, signature)?;
                VoteType::Agree
            }
            _ => VoteType::Disagree,
        };
        let message = self.sign_bytes(index, vote_type);
        self.validator_signatures[index] = Some(signer.sign(Some(NAMESPACE), &message));
        self.votes.set(index);
        match vote_type {
            VoteType::Agree => {
                self.vote_types.set(index);
                self.total_agree_voting_power += validator.voting_power;
            }
            VoteType::Disagree => {
                self.total_disagree_voting_power += validator.voting_power;
            }
        }
        Ok(vote_type)
    }

    /// Returns whether either agree or disagree votes reached the threshold.
    pub fn has_converged(&self, threshold: SigningThreshold, validators: &ValidatorSet<P>) -> bool {
        let total = validators.total_voting_power();
        threshold.reached(self.total_agree_voting_power, total)
            || threshold.reached(self.total_disagree_voting_power, total)
    }

    /// Returns the agreeing signatures if they reached the threshold.
    pub fn aggregate(
        &self,
        threshold: SigningThreshold,
        validators: &ValidatorSet<P>,
    ) -> Option<AggregateResponse> {
        self.payload.response.to_aggregate(threshold, validators)
    }
}

impl<P: PublicKey> Write for VoteSet<P> {
    fn write(&self, buf: &mut impl BufMut) {
        write_string(&self.id, buf);
        self.nonce.write(buf);
        self.validators_hash.write(buf);
        write_string(&self.chain_id, buf);
        self.total_agree_voting_power.write(buf);
        self.total_disagree_voting_power.write(buf);
        self.creation_time.write(buf);
        self.votes.write(buf);
        self.vote_types.write(buf);
        self.payload.write(buf);
        self.execution_context.write(buf);
        self.validator_signatures.write(buf);
        self.validator_addresses.write(buf);
    }
}

impl<P: PublicKey> EncodeSize for VoteSet<P> {
    fn encode_size(&self) -> usize {
        string_size(&self.id)
            + self.nonce.encode_size()
            + self.validators_hash.encode_size()
            + string_size(&self.chain_id)
            + self.total_agree_voting_power.encode_size()
            + self.total_disagree_voting_power.encode_size()
            + self.creation_time.encode_size()
            + self.votes.encode_size()
            + self.vote_types.encode_size()
            + self.payload.encode_size()
            + self.execution_context.encode_size()
            + self.validator_signatures.encode_size()
            + self.validator_addresses.encode_size()
    }
}

impl<P: PublicKey> Read for VoteSet<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let id = read_string(buf, MAX_ID_LENGTH, "VoteSet")?;
        let nonce = u64::read(buf)?;
        let validators_hash = Digest::read(buf)?;
        let chain_id = read_string(buf, MAX_ID_LENGTH, "VoteSet")?;
        let total_agree_voting_power = u64::read(buf)?;
        let total_disagree_voting_power = u64::read(buf)?;
        let creation_time = u64::read(buf)?;
        let votes = BitVec::read_cfg(buf, &(..=MAX_VALIDATORS).into())?;
        let vote_types = BitVec::read_cfg(buf, &(..=MAX_VALIDATORS).into())?;
        let payload = Payload::read(buf)?;
        let execution_context = Bytes::read_cfg(buf, &(..=MAX_EXECUTION_CONTEXT_LENGTH).into())?;
        let validator_signatures =
            Vec::<Option<P::Signature>>::read_range(buf, ..=MAX_VALIDATORS)?;
        let validator_addresses = Vec::<P>::read_range(buf, ..=MAX_VALIDATORS)?;
        let size = votes.len();
        if vote_types.len() != size
            || validator_signatures.len() != size
            || validator_addresses.len() != size
        {
            return Err(CodecError::Invalid("VoteSet", "length mismatch"));
        }
        Ok(Self {
            id,
            nonce,
            validators_hash,
            chain_id,
            total_agree_voting_power,
            total_disagree_voting_power,
            creation_time,
            votes,
            vote_types,
            payload,
            execution_context,
            validator_signatures,
            validator_addresses,
        })
    }
}

/// Compares the trustworthiness of a `remote` vote set against the `local` one.
///
/// Returns [Ordering::Greater] if `remote` should replace `local`, [Ordering::Equal] if the two
/// should be merged and [Ordering::Less] if `local` should be kept untouched. When nothing
/// distinguishes the two, `local` is kept.
pub fn compare<P: PublicKey>(
    remote: &VoteSet<P>,
    local: Option<&VoteSet<P>>,
    nonce: u64,
    validators: &ValidatorSet<P>,
    threshold: SigningThreshold,
) -> Ordering {
    let Some(local) = local else {
        if remote.nonce == nonce || remote.has_converged(threshold, validators) {
            return Ordering::Greater;
        }
        return Ordering::Less;
    };
    if remote.nonce == local.nonce {
        return Ordering::Equal;
    }

    // Only a converged vote set can displace the one in flight
    match (
        remote.has_converged(threshold, validators),
        local.has_converged(threshold, validators),
    ) {
        (true, false) => return Ordering::Greater,
        (false, _) => return Ordering::Less,
        (true, true) => {}
    }
    match remote.number_of_votes().cmp(&local.number_of_votes()) {
        Ordering::Equal => {}
        ordering => return ordering,
    }
    let remote_aggregate = remote.aggregate(threshold, validators);
    let local_aggregate = local.aggregate(threshold, validators);
    let (Some(remote_aggregate), Some(local_aggregate)) = (&remote_aggregate, &local_aggregate)
    else {
        return if remote_aggregate.is_some() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    };
    match remote_aggregate
        .number_of_agree_votes()
        .cmp(&local_aggregate.number_of_agree_votes())
    {
        Ordering::Greater => Ordering::Greater,
        _ => Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::function::Oracle;
    use commonware_codec::DecodeExt;
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey},
        PrivateKeyExt as _,
    };
    use std::sync::Arc;

    const CHAIN: &str = "sidechain";
    const FN: &str = "oracleA";
    const VALIDITY: Duration = Duration::from_secs(60);
    const MAX_CONTEXT: usize = 1024;

    fn schemes(n: u64) -> Vec<PrivateKey> {
        (0..n).map(PrivateKey::from_seed).collect()
    }

    fn validator_set(schemes: &[PrivateKey], powers: &[u64]) -> ValidatorSet<PublicKey> {
        ValidatorSet::new(
            schemes
                .iter()
                .zip(powers)
                .map(|(s, p)| Validator {
                    public_key: s.public_key(),
                    voting_power: *p,
                })
                .collect(),
        )
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .set(
                FN,
                Arc::new(Oracle::new(
                    Bytes::from_static(b"price:42"),
                    Bytes::from_static(b"oracle"),
                )),
            )
            .unwrap();
        registry
    }

    fn observation(index: usize) -> IndividualResponse {
        IndividualResponse::success(
            hash(b"price:42"),
            Bytes::from(format!("oracle-{index}")),
        )
    }

    fn propose(
        schemes: &[PrivateKey],
        validators: &ValidatorSet<PublicKey>,
        proposer: usize,
        nonce: u64,
    ) -> VoteSet<PublicKey> {
        let registry = registry();
        let response = Response::new(observation(proposer), proposer, validators.len()).unwrap();
        let payload = Payload::new(Request::new(FN, &registry).unwrap(), response);
        VoteSet::new(
            nonce,
            CHAIN,
            10,
            proposer,
            Bytes::from_static(b"context"),
            payload,
            &schemes[proposer],
            validators,
        )
        .unwrap()
    }

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(20)
    }

    fn check(
        vote_set: &VoteSet<PublicKey>,
        validators: &ValidatorSet<PublicKey>,
    ) -> Result<(), Error> {
        vote_set.is_valid(CHAIN, MAX_CONTEXT, VALIDITY, now(), validators, &registry())
    }

    #[test]
    fn test_sign_bytes_deterministic() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let vote_set = propose(&schemes, &validators, 0, 1);
        assert_eq!(
            vote_set.sign_bytes(0, VoteType::Agree),
            vote_set.sign_bytes(0, VoteType::Agree)
        );
        assert_ne!(
            vote_set.sign_bytes(0, VoteType::Agree),
            vote_set.sign_bytes(0, VoteType::Disagree)
        );
        assert_ne!(
            vote_set.sign_bytes(0, VoteType::Agree),
            vote_set.sign_bytes(1, VoteType::Agree)
        );
    }

    #[test]
    fn test_new_vote_set() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 2, 3, 4]);
        let vote_set = propose(&schemes, &validators, 2, 1);
        assert_eq!(vote_set.total_agree_voting_power, 3);
        assert_eq!(vote_set.total_disagree_voting_power, 0);
        assert_eq!(vote_set.number_of_votes(), 1);
        assert_eq!(vote_set.vote_type(2), Some(VoteType::Agree));
        assert_eq!(vote_set.active_validators(), vec![&schemes[2].public_key()]);
        assert_eq!(vote_set.id, VoteSet::<PublicKey>::identifier(CHAIN, FN, 1, 10));
        assert!(check(&vote_set, &validators).is_ok());
    }

    #[test]
    fn test_new_vote_set_zero_power() {
        let schemes = schemes(2);
        let validators = validator_set(&schemes, &[0, 1]);
        let response = Response::new(observation(0), 0, 2).unwrap();
        let payload = Payload::new(Request::new(FN, &registry()).unwrap(), response);
        let result = VoteSet::new(
            1,
            CHAIN,
            10,
            0,
            Bytes::new(),
            payload,
            &schemes[0],
            &validators,
        );
        assert_eq!(result.unwrap_err(), Error::ZeroVotingPower(0));
    }

    #[test]
    fn test_new_vote_set_invalid_payload() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let response = Response::new(observation(0), 0, 3).unwrap();
        let payload = Payload::new(Request::new(FN, &registry()).unwrap(), response);
        let result = VoteSet::new(
            1,
            CHAIN,
            10,
            0,
            Bytes::new(),
            payload,
            &schemes[0],
            &validators,
        );
        assert_eq!(result.unwrap_err(), Error::ResponseSizeMismatch(3, 4));
    }

    #[test]
    fn test_request_unknown_function() {
        assert_eq!(
            Request::new("missing", &registry()),
            Err(Error::UnknownFunction("missing".to_string()))
        );
    }

    #[test]
    fn test_invalid_signature() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 0, 1);
        vote_set
            .add_vote(1, observation(1), &validators, 1, &schemes[1])
            .unwrap();
        assert!(check(&vote_set, &validators).is_ok());

        // Replace the signature of validator 1 with one over other bytes
        vote_set.validator_signatures[1] = Some(schemes[1].sign(Some(NAMESPACE), b"other"));
        assert_eq!(
            check(&vote_set, &validators),
            Err(Error::InvalidSignature(1))
        );
    }

    #[test]
    fn test_forged_voting_power() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 0, 1);
        vote_set.total_agree_voting_power = 3;
        assert_eq!(
            check(&vote_set, &validators),
            Err(Error::AgreePowerMismatch(3, 1))
        );
    }

    #[test]
    fn test_wrong_validators_hash() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 3, 1);
        vote_set.validators_hash = hash(b"other validators");
        assert_eq!(
            check(&vote_set, &validators),
            Err(Error::ValidatorsHashMismatch)
        );
    }

    #[test]
    fn test_other_validator_set() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let vote_set = propose(&schemes, &validators, 0, 1);
        let reweighted = validator_set(&schemes, &[1, 1, 1, 2]);
        assert_eq!(
            check(&vote_set, &reweighted),
            Err(Error::ValidatorsHashMismatch)
        );
    }

    #[test]
    fn test_rejections() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let vote_set = propose(&schemes, &validators, 0, 1);

        // Wrong chain
        assert_eq!(
            vote_set.is_valid("other", MAX_CONTEXT, VALIDITY, now(), &validators, &registry()),
            Err(Error::ChainIdMismatch)
        );

        // Unknown function
        assert_eq!(
            vote_set.is_valid(
                CHAIN,
                MAX_CONTEXT,
                VALIDITY,
                now(),
                &validators,
                &Registry::new()
            ),
            Err(Error::UnknownFunction(FN.to_string()))
        );

        // Expired
        let later = UNIX_EPOCH + Duration::from_secs(70);
        assert!(vote_set.is_expired(VALIDITY, later));
        assert_eq!(
            vote_set.is_valid(CHAIN, MAX_CONTEXT, VALIDITY, later, &validators, &registry()),
            Err(Error::Expired)
        );

        // Context too large
        assert_eq!(
            vote_set.is_valid(CHAIN, 3, VALIDITY, now(), &validators, &registry()),
            Err(Error::ContextTooLarge(7))
        );
    }

    #[test]
    fn test_vote_without_oracle_signature() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 0, 1);
        vote_set
            .add_vote(1, observation(1), &validators, 1, &schemes[1])
            .unwrap();

        // Drop the oracle signature backing the agree vote
        vote_set.payload.response.oracle_signatures[1] = None;
        assert_eq!(
            check(&vote_set, &validators),
            Err(Error::ResponseSignatureMismatch(1))
        );
    }

    #[test]
    fn test_add_vote() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 0, 1);

        // Agree
        let vote = vote_set
            .add_vote(1, observation(1), &validators, 1, &schemes[1])
            .unwrap();
        assert_eq!(vote, VoteType::Agree);

        // Disagree (different output)
        let other = IndividualResponse::success(hash(b"price:43"), Bytes::from_static(b"sig"));
        let vote = vote_set
            .add_vote(1, other, &validators, 2, &schemes[2])
            .unwrap();
        assert_eq!(vote, VoteType::Disagree);
        assert_eq!(vote_set.payload.response.oracle_signatures[2], None);

        // Disagree (failed execution)
        let vote = vote_set
            .add_vote(
                1,
                IndividualResponse::failure("unreachable"),
                &validators,
                3,
                &schemes[3],
            )
            .unwrap();
        assert_eq!(vote, VoteType::Disagree);

        assert_eq!(vote_set.total_agree_voting_power, 2);
        assert_eq!(vote_set.total_disagree_voting_power, 2);
        assert!(check(&vote_set, &validators).is_ok());

        // Duplicate
        assert_eq!(
            vote_set.add_vote(1, observation(1), &validators, 1, &schemes[1]),
            Err(Error::VoteAlreadyCast(1))
        );

        // Wrong nonce
        let mut fresh = propose(&schemes, &validators, 0, 1);
        assert_eq!(
            fresh.add_vote(2, observation(1), &validators, 1, &schemes[1]),
            Err(Error::NonceMismatch(1, 2))
        );
    }

    #[test]
    fn test_threshold() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 0, 1);
        vote_set
            .add_vote(1, observation(1), &validators, 1, &schemes[1])
            .unwrap();
        assert!(!vote_set.has_converged(SigningThreshold::Maj23, &validators));
        assert!(vote_set
            .aggregate(SigningThreshold::Maj23, &validators)
            .is_none());

        // 3 >= 4 * 2 / 3 + 1
        vote_set
            .add_vote(1, observation(2), &validators, 2, &schemes[2])
            .unwrap();
        assert!(vote_set.has_converged(SigningThreshold::Maj23, &validators));
        assert!(!vote_set.has_converged(SigningThreshold::All, &validators));

        vote_set
            .add_vote(1, observation(3), &validators, 3, &schemes[3])
            .unwrap();
        assert!(vote_set.has_converged(SigningThreshold::All, &validators));
    }

    #[test]
    fn test_threshold_disagree() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 0, 1);
        for i in 1..4 {
            vote_set
                .add_vote(
                    1,
                    IndividualResponse::failure("down"),
                    &validators,
                    i,
                    &schemes[i],
                )
                .unwrap();
        }
        assert!(vote_set.has_converged(SigningThreshold::Maj23, &validators));
        assert!(vote_set
            .aggregate(SigningThreshold::Maj23, &validators)
            .is_none());
    }

    #[test]
    fn test_single_validator_converges() {
        let schemes = schemes(1);
        let validators = validator_set(&schemes, &[1]);
        let vote_set = propose(&schemes, &validators, 0, 1);
        assert!(vote_set.has_converged(SigningThreshold::Maj23, &validators));
        assert!(vote_set.has_converged(SigningThreshold::All, &validators));
    }

    #[test]
    fn test_aggregate() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 0, 1);
        for i in [1, 3] {
            vote_set
                .add_vote(1, observation(i), &validators, i, &schemes[i])
                .unwrap();
        }
        let aggregate = vote_set
            .aggregate(SigningThreshold::Maj23, &validators)
            .unwrap();
        assert_eq!(aggregate.hash, hash(b"price:42"));
        assert_eq!(aggregate.number_of_agree_votes(), 3);
        assert_eq!(aggregate.agree_index(0), Some(0));
        assert_eq!(aggregate.agree_index(1), Some(1));
        assert_eq!(aggregate.agree_index(2), None);
        assert_eq!(aggregate.agree_index(3), Some(2));
        assert_eq!(
            aggregate.oracle_signatures[3],
            Some(Bytes::from_static(b"oracle-3"))
        );
    }

    #[test]
    fn test_simultaneous_proposals_merge() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut a = propose(&schemes, &validators, 0, 1);
        a.add_vote(1, observation(2), &validators, 2, &schemes[2])
            .unwrap();
        let mut b = propose(&schemes, &validators, 1, 1);
        b.add_vote(1, observation(3), &validators, 3, &schemes[3])
            .unwrap();

        // Same nonce is a tie
        assert_eq!(
            compare(&b, Some(&a), 1, &validators, SigningThreshold::Maj23),
            Ordering::Equal
        );

        let mut ab = a.clone();
        assert!(ab.merge(&validators, &b).unwrap());
        let mut ba = b.clone();
        assert!(ba.merge(&validators, &a).unwrap());

        // Union of both signer sets
        assert_eq!(ab.number_of_votes(), 4);
        assert_eq!(ab.votes, ba.votes);
        assert_eq!(ab.vote_types, ba.vote_types);
        assert_eq!(ab.payload.response.signatures, ba.payload.response.signatures);
        assert_eq!(ab.total_agree_voting_power, 4);
        assert_eq!(ab.total_agree_voting_power, ba.total_agree_voting_power);
        assert_eq!(ab, ba);
        assert!(check(&ab, &validators).is_ok());

        // Idempotent
        assert!(!ab.merge(&validators, &b).unwrap());
        assert!(!ab.merge(&validators, &ba).unwrap());
    }

    #[test]
    fn test_merge_keeps_existing_votes() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut local = propose(&schemes, &validators, 0, 1);
        local
            .add_vote(
                1,
                IndividualResponse::failure("down"),
                &validators,
                1,
                &schemes[1],
            )
            .unwrap();
        let mut remote = propose(&schemes, &validators, 0, 1);
        remote
            .add_vote(1, observation(1), &validators, 1, &schemes[1])
            .unwrap();
        remote
            .add_vote(1, observation(2), &validators, 2, &schemes[2])
            .unwrap();

        let before = local.number_of_votes();
        assert!(local.merge(&validators, &remote).unwrap());
        assert!(local.number_of_votes() >= before);
        assert!(local.number_of_votes() >= remote.number_of_votes());

        // Validator 1 keeps its original disagree vote
        assert_eq!(local.vote_type(1), Some(VoteType::Disagree));
        assert_eq!(local.total_agree_voting_power, 2);
        assert_eq!(local.total_disagree_voting_power, 1);
        assert!(check(&local, &validators).is_ok());
    }

    #[test]
    fn test_merge_different_payload() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut a = propose(&schemes, &validators, 0, 1);
        let registry = registry();
        let other = IndividualResponse::success(hash(b"price:43"), Bytes::from_static(b"sig"));
        let payload = Payload::new(
            Request::new(FN, &registry).unwrap(),
            Response::new(other, 1, 4).unwrap(),
        );
        let b = VoteSet::new(
            1,
            CHAIN,
            10,
            1,
            Bytes::from_static(b"context"),
            payload,
            &schemes[1],
            &validators,
        )
        .unwrap();
        assert_eq!(a.merge(&validators, &b), Err(Error::MergeDiffPayload));
        assert_eq!(a.number_of_votes(), 1);
    }

    #[test]
    fn test_response_merge() {
        let mut a = Response::new(observation(0), 0, 3).unwrap();
        let mut b = Response::new(observation(2), 2, 3).unwrap();
        assert!(a.canonical_compare(&b));
        assert!(!a.compare(&b));
        assert!(a.merge(&b).unwrap());
        assert!(b.merge(&a).unwrap());
        assert!(a.compare(&b));
        assert!(!a.merge(&b).unwrap());
        assert_eq!(
            a.add_signature(0, Bytes::from_static(b"again")),
            Err(Error::SignatureAlreadyPresent(0))
        );

        let c = Response::new(IndividualResponse::failure("down"), 1, 3).unwrap();
        assert_eq!(a.merge(&c), Err(Error::MergeDiffPayload));
    }

    #[test]
    fn test_compare() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let threshold = SigningThreshold::Maj23;
        let one = propose(&schemes, &validators, 0, 1);
        let mut two = propose(&schemes, &validators, 0, 2);

        // No local copy
        assert_eq!(
            compare(&one, None, 1, &validators, threshold),
            Ordering::Greater
        );
        assert_eq!(
            compare(&two, None, 1, &validators, threshold),
            Ordering::Less
        );

        // Converged vote sets are adopted even at another nonce
        two.add_vote(2, observation(1), &validators, 1, &schemes[1])
            .unwrap();
        two.add_vote(2, observation(2), &validators, 2, &schemes[2])
            .unwrap();
        assert_eq!(
            compare(&two, None, 1, &validators, threshold),
            Ordering::Greater
        );
        assert_eq!(
            compare(&two, Some(&one), 1, &validators, threshold),
            Ordering::Greater
        );
        assert_eq!(
            compare(&one, Some(&two), 2, &validators, threshold),
            Ordering::Less
        );

        // Unconverged vote sets never displace local, whatever their votes
        let mut three = propose(&schemes, &validators, 0, 3);
        three
            .add_vote(3, observation(1), &validators, 1, &schemes[1])
            .unwrap();
        assert_eq!(
            compare(&three, Some(&one), 1, &validators, threshold),
            Ordering::Less
        );
        assert_eq!(
            compare(&one, Some(&three), 3, &validators, threshold),
            Ordering::Less
        );

        // Between converged vote sets, more votes win
        let mut five = propose(&schemes, &validators, 0, 5);
        for i in 1..4 {
            five.add_vote(5, observation(i), &validators, i, &schemes[i])
                .unwrap();
        }
        assert_eq!(
            compare(&five, Some(&two), 2, &validators, threshold),
            Ordering::Greater
        );
        assert_eq!(
            compare(&two, Some(&five), 5, &validators, threshold),
            Ordering::Less
        );

        // Complete tie keeps local
        let four = propose(&schemes, &validators, 1, 4);
        assert_eq!(
            compare(&four, Some(&one), 1, &validators, threshold),
            Ordering::Less
        );
        assert_eq!(
            compare(&one, Some(&four), 4, &validators, threshold),
            Ordering::Less
        );
    }

    #[test]
    fn test_overrides() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let overridden = validators
            .with_overrides(&[
                (schemes[2].public_key(), 10),
                (schemes[0].public_key(), 5),
            ])
            .unwrap();
        assert_eq!(overridden.len(), 2);
        assert_eq!(overridden.index_of(&schemes[2].public_key()), Some(0));
        assert_eq!(overridden.total_voting_power(), 15);
        assert_ne!(overridden.hash(), validators.hash());

        let stranger = PrivateKey::from_seed(99).public_key();
        assert!(matches!(
            validators.with_overrides(&[(stranger, 1)]),
            Err(Error::UnknownOverride(_))
        ));
    }

    #[test]
    fn test_codec() {
        let schemes = schemes(4);
        let validators = validator_set(&schemes, &[1, 1, 1, 1]);
        let mut vote_set = propose(&schemes, &validators, 0, 1);
        vote_set
            .add_vote(
                1,
                IndividualResponse::failure("down"),
                &validators,
                1,
                &schemes[1],
            )
            .unwrap();
        let encoded = vote_set.encode();
        assert_eq!(encoded.len(), vote_set.encode_size());
        let decoded = VoteSet::<PublicKey>::decode(encoded.clone()).unwrap();
        assert_eq!(decoded, vote_set);
        assert_eq!(decoded.encode(), encoded);
        assert!(check(&decoded, &validators).is_ok());

        let decoded = ValidatorSet::<PublicKey>::decode(validators.encode()).unwrap();
        assert_eq!(decoded.hash(), validators.hash());
    }

    #[test]
    fn test_codec_truncated() {
        let schemes = schemes(2);
        let validators = validator_set(&schemes, &[1, 1]);
        let vote_set = propose(&schemes, &validators, 0, 1);
        let encoded = vote_set.encode();
        assert!(VoteSet::<PublicKey>::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
