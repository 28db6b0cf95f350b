use crate::{registry::Registry, types::SigningThreshold, Store, Validators};
use commonware_cryptography::{PublicKey, Signer};
use std::time::Duration;

/// Configuration for the [super::Engine].
pub struct Config<P, C, V, S>
where
    P: PublicKey,
    C: Signer<PublicKey = P, Signature = P::Signature>,
    V: Validators<PublicKey = P>,
    S: Store,
{
    /// Signer used to vote.
    pub crypto: C,

    /// Identifier of the host chain (vote sets for other chains are rejected).
    pub chain_id: String,

    /// Functions to reach agreement on.
    pub registry: Registry,

    /// Source of the host chain's validator set.
    pub validators: V,

    /// Durable store the reactor state is persisted to.
    pub store: S,

    /// Voting power required for a vote set to converge.
    pub signing_threshold: SigningThreshold,

    /// Validators (and voting power) replacing the host validator set, if not empty.
    pub override_validators: Vec<(P, u64)>,

    /// Size of the mailbox.
    pub mailbox_size: usize,

    /// Whether to send gossip with priority.
    pub priority: bool,

    /// Interval between proposals (rounds are aligned to multiples of this interval).
    pub propose_interval: Duration,

    /// Delay after a round boundary before proposing.
    pub propose_delay: Duration,

    /// Interval between commits (aligned to multiples of this interval).
    pub commit_interval: Duration,

    /// Delay after a commit boundary before committing.
    pub commit_delay: Duration,

    /// Upper bound of the per-validator delay spreading timers apart.
    pub max_jitter: Duration,

    /// Delay between gossiping the last converged vote set and the in-flight one.
    pub propagation_delay: Duration,

    /// How long a vote set is accepted after its creation.
    pub validity_period: Duration,

    /// How long a converged vote set is accepted after its creation (during catch-up).
    pub sync_validity_period: Duration,

    /// How often to check whether the validator set is available during startup.
    pub startup_retry: Duration,

    /// Maximum size of an execution context.
    pub max_context_size: usize,
}
