//! Drive registered functions to agreement over gossip.
//!
//! # Design
//!
//! The [Engine] is a single actor that owns the [crate::state::ReactorState] and multiplexes:
//! - A propose timer, aligned to multiples of the propose interval, that executes every function
//!   without an in-flight vote set and gossips the resulting (self-signed) vote set
//! - A commit timer, aligned to multiples of the commit interval, that finalizes converged vote
//!   sets (submitting the collected signatures when it is this validator's turn) and gossips the
//!   rest again
//! - The vote set channel, over which partially signed vote sets are merged, replaced or signed
//! - The converged vote set channel, over which lagging validators catch up
//! - A [Mailbox] informing it about connected peers
//!
//! Timers are offset by a per-validator jitter (derived from the validator's index) so that
//! validators do not all act at once. Every change to the state is persisted before it is
//! gossiped.
//!
//! Function callbacks run inline on the actor and are expected to return promptly. A callback
//! that panics is contained and the function is skipped for the round.

use std::time::Duration;

mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::{Mailbox, Message};
mod metrics;

/// Channel partially signed vote sets are gossiped on.
pub const VOTE_SET_CHANNEL: u32 = 0x50;

/// Channel converged vote sets are gossiped on.
pub const MAJ_VOTE_SET_CHANNEL: u32 = 0x51;

/// Maximum size of a gossiped message.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default maximum size of an execution context.
pub const MAX_CONTEXT_SIZE: usize = 1024;

/// Default interval between proposals.
pub const PROPOSE_INTERVAL: Duration = Duration::from_secs(10);

/// Default delay after a round boundary before proposing.
pub const PROPOSE_DELAY: Duration = Duration::from_millis(500);

/// Default interval between commits.
pub const COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Default delay after a commit boundary before committing.
pub const COMMIT_DELAY: Duration = Duration::from_millis(100);

/// Default bound of the per-validator timer jitter.
pub const MAX_JITTER: Duration = Duration::from_secs(2);

/// Default delay between gossiping the last converged vote set and the in-flight one.
pub const PROPAGATION_DELAY: Duration = Duration::from_secs(1);

/// Default validity of a vote set.
pub const VALIDITY_PERIOD: Duration = Duration::from_secs(60);

/// Default validity of a converged vote set received while catching up.
pub const SYNC_VALIDITY_PERIOD: Duration = Duration::from_secs(300);

/// Default interval between checks for the validator set during startup.
pub const STARTUP_RETRY: Duration = Duration::from_secs(2);
