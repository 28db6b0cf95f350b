use super::{
    ingress::{Mailbox, Message},
    metrics::{FnLabel, Metrics, Outcome, OutcomeLabel},
    Config,
};
use crate::{
    registry::Registry,
    state::ReactorState,
    types::{
        self, hash, IndividualResponse, Payload, Request, Response, SigningThreshold,
        ValidatorSet, VoteSet, MAX_ORACLE_SIGNATURE_LENGTH, STATUS_OK,
    },
    Function, Store, Validators,
};
use bytes::Bytes;
use commonware_codec::{DecodeExt, Encode};
use commonware_cryptography::{PublicKey, Signer};
use commonware_macros::select;
use commonware_p2p::{Receiver, Recipients, Sender};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{
    channel::mpsc,
    future::{self, Either},
    StreamExt,
};
use std::{
    cmp::Ordering,
    collections::{BTreeSet, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, warn};

/// Returns the first multiple of `interval` (since the unix epoch) strictly after `now`.
fn next_boundary(now: SystemTime, interval: Duration) -> SystemTime {
    let since = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    let interval = interval.as_millis().max(1);
    let next = (since / interval + 1) * interval;
    UNIX_EPOCH + Duration::from_millis(next as u64)
}

/// Drives every registered [Function] to agreement, one nonce at a time.
pub struct Engine<E, P, C, V, S>
where
    E: Clock + Spawner + RuntimeMetrics,
    P: PublicKey,
    C: Signer<PublicKey = P, Signature = P::Signature>,
    V: Validators<PublicKey = P>,
    S: Store,
{
    context: E,
    crypto: C,
    me: P,
    chain_id: String,
    registry: Registry,
    validators: V,
    store: S,
    signing_threshold: SigningThreshold,
    override_validators: Vec<(P, u64)>,
    priority: bool,

    propose_interval: Duration,
    propose_delay: Duration,
    commit_interval: Duration,
    commit_delay: Duration,
    max_jitter: Duration,
    propagation_delay: Duration,
    validity_period: Duration,
    sync_validity_period: Duration,
    startup_retry: Duration,
    max_context_size: usize,

    mailbox: mpsc::Receiver<Message<P>>,
    peers: BTreeSet<P>,

    state: ReactorState<P>,

    // Offset of this validator's timers within a round
    jitter: Duration,

    // Vote sets waiting to be gossiped (in deadline order)
    pending: VecDeque<(SystemTime, Bytes)>,

    metrics: Metrics,
}

impl<E, P, C, V, S> Engine<E, P, C, V, S>
where
    E: Clock + Spawner + RuntimeMetrics,
    P: PublicKey,
    C: Signer<PublicKey = P, Signature = P::Signature>,
    V: Validators<PublicKey = P>,
    S: Store,
{
    /// Create a new engine.
    pub fn new(context: E, cfg: Config<P, C, V, S>) -> (Self, Mailbox<P>) {
        let (sender, mailbox) = mpsc::channel(cfg.mailbox_size);
        let metrics = Metrics::init(context.clone());
        let me = cfg.crypto.public_key();
        (
            Self {
                context,
                crypto: cfg.crypto,
                me,
                chain_id: cfg.chain_id,
                registry: cfg.registry,
                validators: cfg.validators,
                store: cfg.store,
                signing_threshold: cfg.signing_threshold,
                override_validators: cfg.override_validators,
                priority: cfg.priority,

                propose_interval: cfg.propose_interval,
                propose_delay: cfg.propose_delay,
                commit_interval: cfg.commit_interval,
                commit_delay: cfg.commit_delay,
                max_jitter: cfg.max_jitter,
                propagation_delay: cfg.propagation_delay,
                validity_period: cfg.validity_period,
                sync_validity_period: cfg.sync_validity_period,
                startup_retry: cfg.startup_retry,
                max_context_size: cfg.max_context_size,

                mailbox,
                peers: BTreeSet::new(),

                state: ReactorState::default(),
                jitter: Duration::ZERO,
                pending: VecDeque::new(),

                metrics,
            },
            Mailbox::new(sender),
        )
    }

    /// Start the engine with the vote set and converged vote set channels.
    pub fn start<NetS, NetR>(
        self,
        vote_network: (NetS, NetR),
        maj_network: (NetS, NetR),
    ) -> Handle<()>
    where
        NetS: Sender<PublicKey = P>,
        NetR: Receiver<PublicKey = P>,
    {
        let context = self.context.clone();
        context.spawn(|_| self.run(vote_network, maj_network))
    }

    async fn run<NetS, NetR>(mut self, vote_network: (NetS, NetR), maj_network: (NetS, NetR))
    where
        NetS: Sender<PublicKey = P>,
        NetR: Receiver<PublicKey = P>,
    {
        let (mut vote_sender, mut vote_receiver) = vote_network;
        let (mut maj_sender, mut maj_receiver) = maj_network;
        let mut shutdown = self.context.stopped();

        // Restore persisted state
        self.state = match ReactorState::load(&mut self.store).await {
            Ok(state) => state,
            Err(err) => {
                error!(?err, "failed to load state");
                return;
            }
        };
        for (fn_id, nonce) in &self.state.current_nonces {
            self.metrics
                .nonce
                .get_or_create(&FnLabel::new(fn_id))
                .set(*nonce as i64);
        }

        // Wait for the validator set to become available
        loop {
            match self.validator_set().await {
                Ok(Some(validators)) => {
                    self.update_jitter(&validators);
                    info!(validators = validators.len(), "validator set available");
                    break;
                }
                Ok(None) => {
                    debug!(retry = ?self.startup_retry, "validator set not available");
                }
                Err(err) => {
                    error!(?err, "invalid override validators");
                    return;
                }
            }
            select! {
                _ = &mut shutdown => {
                    debug!("shutdown");
                    return;
                },
                _ = self.context.sleep(self.startup_retry) => {},
            }
        }

        let now = self.context.current();
        let mut propose_boundary = next_boundary(now, self.propose_interval);
        let mut commit_boundary = next_boundary(now, self.commit_interval);
        loop {
            let propose = self
                .context
                .sleep_until(propose_boundary + self.propose_delay + self.jitter);
            let commit = self
                .context
                .sleep_until(commit_boundary + self.commit_delay + self.jitter);
            let rebroadcast = match self.pending.front() {
                Some((deadline, _)) => Either::Left(self.context.sleep_until(*deadline)),
                None => Either::Right(future::pending()),
            };

            select! {
                _ = &mut shutdown => {
                    debug!("shutdown");
                    return;
                },
                _ = propose => {
                    self.propose(propose_boundary, &mut vote_sender).await;
                    propose_boundary = next_boundary(self.context.current(), self.propose_interval);
                },
                _ = commit => {
                    self.commit(&mut maj_sender).await;
                    commit_boundary = next_boundary(self.context.current(), self.commit_interval);
                },
                _ = rebroadcast => {
                    let Some((_, message)) = self.pending.pop_front() else {
                        continue;
                    };
                    self.broadcast(&mut vote_sender, message, None).await;
                },
                mailbox = self.mailbox.next() => {
                    let Some(message) = mailbox else {
                        error!("mailbox closed");
                        return;
                    };
                    match message {
                        Message::AddPeer { peer } => {
                            debug!(?peer, "peer added");
                            self.peers.insert(peer);
                        }
                        Message::RemovePeer { peer } => {
                            debug!(?peer, "peer removed");
                            self.peers.remove(&peer);
                        }
                    }
                },
                msg = vote_receiver.recv() => {
                    let (sender, msg) = match msg {
                        Ok(r) => r,
                        Err(err) => {
                            error!(?err, "vote set receiver failed");
                            return;
                        }
                    };
                    self.handle_vote_set(sender, msg, &mut vote_sender).await;
                },
                msg = maj_receiver.recv() => {
                    let (sender, msg) = match msg {
                        Ok(r) => r,
                        Err(err) => {
                            error!(?err, "converged vote set receiver failed");
                            return;
                        }
                    };
                    self.handle_maj_vote_set(sender, msg, &mut maj_sender).await;
                },
            }
        }
    }

    /// Fetch the validator set, applying override validators (if any).
    async fn validator_set(&mut self) -> Result<Option<ValidatorSet<P>>, types::Error> {
        let Some(validators) = self.validators.current().await else {
            return Ok(None);
        };
        if self.override_validators.is_empty() {
            return Ok(Some(validators));
        }
        validators.with_overrides(&self.override_validators).map(Some)
    }

    async fn refresh(&mut self) -> Option<ValidatorSet<P>> {
        match self.validator_set().await {
            Ok(Some(validators)) => {
                self.update_jitter(&validators);
                Some(validators)
            }
            Ok(None) => {
                warn!("validator set not available");
                None
            }
            Err(err) => {
                error!(?err, "invalid override validators");
                None
            }
        }
    }

    fn update_jitter(&mut self, validators: &ValidatorSet<P>) {
        self.jitter = match validators.index_of(&self.me) {
            Some(index) => self.max_jitter * index as u32 / validators.len() as u32,
            None => Duration::ZERO,
        };
    }

    /// Invoke a [Function] callback, containing any panic.
    fn guard<T>(&self, fn_id: &str, callback: &'static str, f: impl FnOnce() -> T) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => Some(result),
            Err(_) => {
                self.metrics.panics.inc();
                error!(fn_id, callback, "function panicked");
                None
            }
        }
    }

    /// Execute `function` in `context`, returning this validator's response.
    ///
    /// Returns `None` if a callback panicked.
    fn execute(
        &self,
        fn_id: &str,
        function: &Arc<dyn Function>,
        context: &[u8],
    ) -> Option<IndividualResponse> {
        let (message, signature) = match self.guard(fn_id, "get_message_and_signature", || {
            function.get_message_and_signature(context)
        })? {
            Ok(result) => result,
            Err(err) => {
                warn!(fn_id, ?err, "failed to execute function");
                return Some(IndividualResponse::failure(&err.to_string()));
            }
        };
        if signature.len() > MAX_ORACLE_SIGNATURE_LENGTH {
            warn!(fn_id, size = signature.len(), "oracle signature too large");
            return Some(IndividualResponse::failure("oracle signature too large"));
        }
        let digest = hash(&message);
        if let Err(err) = self.guard(fn_id, "map_message", || {
            function.map_message(context, digest.as_ref(), &message)
        })? {
            warn!(fn_id, ?err, "failed to map message");
            return Some(IndividualResponse::failure(&err.to_string()));
        }
        Some(IndividualResponse::success(digest, signature))
    }

    async fn persist(&mut self) -> bool {
        if let Err(err) = self.state.save(&mut self.store).await {
            error!(?err, "failed to persist state");
            return false;
        }
        true
    }

    async fn broadcast<NetS: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut NetS,
        message: Bytes,
        exclude: Option<&P>,
    ) {
        let recipients: Vec<P> = self
            .peers
            .iter()
            .filter(|peer| Some(*peer) != exclude)
            .cloned()
            .collect();
        if recipients.is_empty() {
            return;
        }
        if let Err(err) = sender
            .send(Recipients::Some(recipients), message, self.priority)
            .await
        {
            warn!(?err, "failed to broadcast");
        }
    }

    /// Propose a vote set for every function without one in flight.
    async fn propose<NetS: Sender<PublicKey = P>>(
        &mut self,
        boundary: SystemTime,
        vote_sender: &mut NetS,
    ) {
        let Some(validators) = self.refresh().await else {
            return;
        };
        let Some(index) = validators.index_of(&self.me) else {
            debug!("not a validator, skipping proposals");
            return;
        };
        let creation_time = boundary
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        for fn_id in self.registry.sorted_ids() {
            if self.state.current_vote_sets.contains_key(&fn_id) {
                continue;
            }
            let Some(function) = self.registry.get(&fn_id) else {
                continue;
            };
            let context = match self.guard(&fn_id, "prepare_context", || function.prepare_context()) {
                Some(Ok(Some(context))) => context,
                Some(Ok(None)) => {
                    debug!(fn_id, "function not ready");
                    continue;
                }
                Some(Err(err)) => {
                    warn!(fn_id, ?err, "failed to prepare context");
                    continue;
                }
                None => continue,
            };
            if context.len() > self.max_context_size {
                warn!(fn_id, size = context.len(), "execution context too large");
                continue;
            }
            let Some(individual) = self.execute(&fn_id, &function, &context) else {
                continue;
            };
            if individual.status != STATUS_OK {
                continue;
            }

            // Create the vote set
            let nonce = self.state.nonce(&fn_id);
            let vote_set = Request::new(fn_id.clone(), &self.registry).and_then(|request| {
                let response = Response::new(individual, index, validators.len())?;
                VoteSet::new(
                    nonce,
                    &self.chain_id,
                    creation_time,
                    index,
                    context,
                    Payload::new(request, response),
                    &self.crypto,
                    &validators,
                )
            });
            let vote_set = match vote_set {
                Ok(vote_set) => vote_set,
                Err(err) => {
                    warn!(fn_id, ?err, "failed to create vote set");
                    continue;
                }
            };
            self.metrics.proposals.inc();

            // Our vote alone may be enough
            if vote_set.has_converged(self.signing_threshold, &validators) {
                info!(fn_id, nonce, "vote set converged without gossip");
                self.finalize(&fn_id, vote_set, &validators);
                if !self.persist().await {
                    return;
                }
                continue;
            }

            debug!(fn_id, nonce, "proposed vote set");
            let message = vote_set.encode().freeze();
            self.state.current_vote_sets.insert(fn_id, vote_set);
            if !self.persist().await {
                return;
            }
            self.broadcast(vote_sender, message, None).await;
        }
    }

    /// Finalize converged vote sets and gossip the rest.
    async fn commit<NetS: Sender<PublicKey = P>>(&mut self, maj_sender: &mut NetS) {
        let Some(validators) = self.refresh().await else {
            return;
        };
        let now = self.context.current();
        let fn_ids: Vec<String> = self.state.current_vote_sets.keys().cloned().collect();
        for fn_id in fn_ids {
            let Some(vote_set) = self.state.current_vote_sets.get(&fn_id) else {
                continue;
            };
            let valid = vote_set.is_valid(
                &self.chain_id,
                self.max_context_size,
                self.validity_period,
                now,
                &validators,
                &self.registry,
            );
            let converged = vote_set.has_converged(self.signing_threshold, &validators);
            if let Err(err) = valid {
                info!(fn_id, ?err, "discarding invalid vote set");
                self.state.current_vote_sets.remove(&fn_id);
                if !self.persist().await {
                    return;
                }
                continue;
            }

            if !converged {
                // Help stragglers catch up before gossiping the in-flight vote set again
                let message = vote_set.encode().freeze();
                let previous = self
                    .state
                    .previous_maj_vote_sets
                    .get(&fn_id)
                    .map(|previous| previous.encode().freeze());
                if let Some(previous) = previous {
                    self.broadcast(maj_sender, previous, None).await;
                }
                self.pending
                    .push_back((now + self.propagation_delay, message));
                continue;
            }

            let Some(vote_set) = self.state.current_vote_sets.remove(&fn_id) else {
                continue;
            };
            info!(fn_id, nonce = vote_set.nonce, "vote set converged");
            self.finalize(&fn_id, vote_set, &validators);
            if !self.persist().await {
                return;
            }
        }
    }

    /// Submit the signatures of a converged vote set (if responsible) and advance the nonce.
    fn finalize(&mut self, fn_id: &str, vote_set: VoteSet<P>, validators: &ValidatorSet<P>) {
        let nonce = vote_set.nonce;
        if let (Some(index), Some(aggregate)) = (
            validators.index_of(&self.me),
            vote_set.aggregate(self.signing_threshold, validators),
        ) {
            // Agreeing validators take turns submitting
            let agree = aggregate.number_of_agree_votes() as u64;
            let responsible = agree > 0
                && aggregate
                    .agree_index(index)
                    .is_some_and(|rank| nonce % agree == rank as u64);
            if responsible {
                if let Some(function) = self.registry.get(fn_id) {
                    let submitted = self.guard(fn_id, "submit_multi_signed_message", || {
                        function.submit_multi_signed_message(
                            &vote_set.execution_context,
                            aggregate.hash.as_ref(),
                            aggregate.oracle_signatures.clone(),
                        )
                    });
                    if submitted.is_some() {
                        info!(fn_id, nonce, agree, "submitted multi-signed message");
                        self.metrics
                            .submitted
                            .get_or_create(&FnLabel::new(fn_id))
                            .inc();
                    }
                }
            }
        }

        self.state
            .current_nonces
            .insert(fn_id.to_string(), nonce + 1);
        self.metrics
            .nonce
            .get_or_create(&FnLabel::new(fn_id))
            .set((nonce + 1) as i64);
        self.state
            .previous_maj_vote_sets
            .insert(fn_id.to_string(), vote_set);
        self.state.previous_validator_set = Some(validators.clone());
        self.metrics.commits.inc();
    }

    fn record(&self, outcome: Outcome) {
        self.metrics
            .vote_sets
            .get_or_create(&OutcomeLabel::new(outcome))
            .inc();
    }

    fn record_maj(&self, outcome: Outcome) {
        self.metrics
            .maj_vote_sets
            .get_or_create(&OutcomeLabel::new(outcome))
            .inc();
    }

    async fn handle_vote_set<NetS: Sender<PublicKey = P>>(
        &mut self,
        sender: P,
        msg: Bytes,
        vote_sender: &mut NetS,
    ) {
        let vote_set = match VoteSet::<P>::decode(msg) {
            Ok(vote_set) => vote_set,
            Err(err) => {
                warn!(?err, ?sender, "failed to decode vote set");
                self.record(Outcome::Invalid);
                return;
            }
        };
        let Some(validators) = self.refresh().await else {
            return;
        };
        if let Err(err) = vote_set.is_valid(
            &self.chain_id,
            self.max_context_size,
            self.validity_period,
            self.context.current(),
            &validators,
            &self.registry,
        ) {
            warn!(?err, ?sender, "received invalid vote set");
            self.record(Outcome::Invalid);
            return;
        }
        let fn_id = vote_set.fn_id().to_string();
        let nonce = self.state.nonce(&fn_id);
        if vote_set.nonce < nonce {
            debug!(fn_id, remote = vote_set.nonce, nonce, "ignoring stale vote set");
            self.record(Outcome::Stale);
            return;
        }

        // Decide whether to merge, replace or keep the local vote set
        let mut changed = false;
        let local = self.state.current_vote_sets.get(&fn_id);
        let has_local = local.is_some();
        match types::compare(&vote_set, local, nonce, &validators, self.signing_threshold) {
            Ordering::Equal => {
                let Some(local) = self.state.current_vote_sets.get_mut(&fn_id) else {
                    return;
                };
                match local.merge(&validators, &vote_set) {
                    Ok(merged) => changed = merged,
                    Err(err) => {
                        warn!(fn_id, ?err, ?sender, "failed to merge vote set");
                        self.record(Outcome::Invalid);
                        return;
                    }
                }
                self.record(Outcome::Merged);
            }
            Ordering::Greater => {
                debug!(fn_id, nonce = vote_set.nonce, ?sender, "replacing local vote set");
                self.state
                    .current_nonces
                    .insert(fn_id.clone(), vote_set.nonce);
                self.state
                    .current_vote_sets
                    .insert(fn_id.clone(), vote_set);
                changed = true;
                self.record(Outcome::Replaced);
            }
            Ordering::Less => {
                self.record(Outcome::Ignored);
                if !has_local {
                    return;
                }
            }
        }

        // Cast our own vote if we have not yet
        let mut contributed = false;
        if let Some(index) = validators.index_of(&self.me) {
            let context = self
                .state
                .current_vote_sets
                .get(&fn_id)
                .filter(|local| !local.has_signed(index))
                .map(|local| local.execution_context.clone());
            let function = self.registry.get(&fn_id);
            if let (Some(context), Some(function)) = (context, function) {
                if let Some(individual) = self.execute(&fn_id, &function, &context) {
                    let nonce = self.state.nonce(&fn_id);
                    if let Some(local) = self.state.current_vote_sets.get_mut(&fn_id) {
                        match local.add_vote(nonce, individual, &validators, index, &self.crypto) {
                            Ok(vote) => {
                                debug!(fn_id, nonce, ?vote, "cast vote");
                                contributed = true;
                                changed = true;
                            }
                            Err(err) => {
                                warn!(fn_id, ?err, "failed to cast vote");
                            }
                        }
                    }
                }
            }
        }
        if !changed {
            return;
        }
        if !self.persist().await {
            return;
        }

        // Only echo back to the sender if we added something it cannot know about
        let Some(local) = self.state.current_vote_sets.get(&fn_id) else {
            return;
        };
        let message = local.encode().freeze();
        let exclude = if contributed { None } else { Some(&sender) };
        self.broadcast(vote_sender, message, exclude).await;
    }

    /// Checks a converged vote set against `validators`.
    fn check_converged(
        &self,
        vote_set: &VoteSet<P>,
        now: SystemTime,
        validators: &ValidatorSet<P>,
    ) -> Result<(), types::Error> {
        vote_set.is_valid(
            &self.chain_id,
            self.max_context_size,
            self.sync_validity_period,
            now,
            validators,
            &self.registry,
        )?;
        if !vote_set.has_converged(self.signing_threshold, validators) {
            return Err(types::Error::NotConverged);
        }
        Ok(())
    }

    async fn handle_maj_vote_set<NetS: Sender<PublicKey = P>>(
        &mut self,
        sender: P,
        msg: Bytes,
        maj_sender: &mut NetS,
    ) {
        let vote_set = match VoteSet::<P>::decode(msg) {
            Ok(vote_set) => vote_set,
            Err(err) => {
                warn!(?err, ?sender, "failed to decode converged vote set");
                self.record_maj(Outcome::Invalid);
                return;
            }
        };
        let Some(validators) = self.refresh().await else {
            return;
        };

        // Fall back to the previous validator set across validator set changes
        let now = self.context.current();
        let validated_by = match self.check_converged(&vote_set, now, &validators) {
            Ok(()) => Some(validators),
            Err(err) => {
                let previous = self
                    .state
                    .previous_validator_set
                    .as_ref()
                    .map(|previous| self.check_converged(&vote_set, now, previous));
                match previous {
                    Some(Ok(())) => self.state.previous_validator_set.clone(),
                    Some(Err(previous_err)) => {
                        warn!(?err, ?previous_err, ?sender, "received invalid converged vote set");
                        None
                    }
                    None => {
                        warn!(?err, ?sender, "received invalid converged vote set");
                        None
                    }
                }
            }
        };
        let Some(validators) = validated_by else {
            self.record_maj(Outcome::Invalid);
            return;
        };

        let fn_id = vote_set.fn_id().to_string();
        let nonce = self.state.nonce(&fn_id);
        if vote_set.nonce < nonce {
            if vote_set.nonce + 1 == nonce
                && !self.state.previous_maj_vote_sets.contains_key(&fn_id)
            {
                debug!(fn_id, nonce = vote_set.nonce, "adopted converged vote set");
                self.state
                    .previous_maj_vote_sets
                    .insert(fn_id, vote_set);
                self.state.previous_validator_set = Some(validators);
                self.record_maj(Outcome::Adopted);
            } else {
                self.record_maj(Outcome::Stale);
            }
            self.persist().await;
            return;
        }

        info!(
            fn_id,
            remote = vote_set.nonce,
            nonce,
            ?sender,
            "caught up with converged vote set"
        );
        let next = vote_set.nonce + 1;
        self.state.current_nonces.insert(fn_id.clone(), next);
        self.metrics
            .nonce
            .get_or_create(&FnLabel::new(&fn_id))
            .set(next as i64);
        self.state.current_vote_sets.remove(&fn_id);
        let message = vote_set.encode().freeze();
        self.state
            .previous_maj_vote_sets
            .insert(fn_id, vote_set);
        self.state.previous_validator_set = Some(validators);
        self.record_maj(Outcome::Adopted);
        if !self.persist().await {
            return;
        }
        self.broadcast(maj_sender, message, None).await;
    }
}
