use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{
    Address, Asset, ChannelHandle, ChannelId, Hash, Phase, Signature, State, U256,
};
use crate::error::Error;
use crate::persistence::{FileStore, PersistedRecord, PersistenceError, Store};
use crate::proposal::{self, ProposalHandler};
use crate::registry::Registry;
use crate::transport::{Adjudicator, PeerBus, PeerRequest, TransportError};
use crate::update::{self, UpdateHandler};
use crate::wallet::Signer;
use crate::watcher;

/// Static client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Name used in log output.
    pub alias: String,
    /// When set, persistence is enabled at construction.
    pub database_path: Option<PathBuf>,
}

type NewChannelFn = dyn Fn(Arc<ChannelHandle>) + Send + Sync;
type ConcludedFn = dyn Fn(ChannelId) + Send + Sync;

#[derive(Default)]
pub(crate) struct Handlers {
    proposal: RwLock<Option<Arc<dyn ProposalHandler>>>,
    update: RwLock<Option<Arc<dyn UpdateHandler>>>,
    new_channel: RwLock<Option<Arc<NewChannelFn>>>,
    concluded: RwLock<Option<Arc<ConcludedFn>>>,
}

impl Handlers {
    pub(crate) fn proposal_handler(&self) -> Option<Arc<dyn ProposalHandler>> {
        self.proposal.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn update_handler(&self) -> Option<Arc<dyn UpdateHandler>> {
        self.update.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn notify_new_channel(&self, handle: Arc<ChannelHandle>) {
        let cb = self.new_channel.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(cb) = cb {
            cb(handle);
        }
    }

    pub(crate) fn notify_concluded(&self, id: ChannelId) {
        let cb = self.concluded.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(cb) = cb {
            cb(id);
        }
    }
}

/// Shared client internals, referenced by the listener and all watcher tasks.
pub(crate) struct Inner<B: PeerBus, A: Adjudicator> {
    pub(crate) alias: String,
    pub(crate) bus: B,
    pub(crate) adjudicator: A,
    pub(crate) signer: Signer,
    pub(crate) registry: Registry,
    pub(crate) handlers: Handlers,
    pub(crate) shutdown: CancellationToken,
    pub(crate) errors: mpsc::UnboundedSender<Error>,
    error_stream: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    store: RwLock<Option<Arc<dyn Store>>>,
    seen_proposals: Mutex<HashSet<Hash>>,
}

impl<B: PeerBus, A: Adjudicator> Inner<B, A> {
    pub(crate) fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Durably record the given (not yet committed) state for a handle.
    /// Must complete before the new state is committed or acknowledged.
    pub(crate) fn persist_state(
        &self,
        handle: &ChannelHandle,
        state: &State,
        signatures: &[Option<Signature>],
        phase: Phase,
    ) -> Result<(), Error> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        let record = PersistedRecord {
            params: handle.params().clone(),
            state: state.clone(),
            signatures: signatures.to_vec(),
            phase,
            part_idx: handle.part_idx(),
            peer: handle.peer(),
        };
        store.save(handle.id(), &record)?;
        Ok(())
    }

    pub(crate) fn persist_handle(&self, handle: &ChannelHandle) -> Result<(), Error> {
        let (state, signatures, phase) = handle.snapshot();
        self.persist_state(handle, &state, &signatures, phase)
    }

    /// Claims an inbound proposal id. `false` means it was already handled;
    /// the replay must be rejected at the protocol level, since the fresh
    /// acceptor nonce share would otherwise open a second channel.
    pub(crate) fn claim_proposal(&self, id: Hash) -> bool {
        self.seen_proposals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id)
    }

    /// Releases a claim whose proposal failed locally, so a retransmit gets
    /// another chance.
    pub(crate) fn release_proposal(&self, id: Hash) {
        self.seen_proposals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// The registry is the sole authority on liveness: a handle whose id is
    /// no longer registered must not be operated on.
    pub(crate) fn ensure_live(&self, handle: &ChannelHandle) -> Result<(), Error> {
        match self.registry.get(handle.id()) {
            Some(_) if handle.phase() != Phase::Closed => Ok(()),
            _ => Err(Error::ChannelClosed),
        }
    }
}

/// The main client object used to open, operate and settle channels.
///
/// It owns the registry of live channels, the shared inbound listener and one
/// dispute-watcher task per channel. Usually you only need one PerunClient.
pub struct PerunClient<B: PeerBus, A: Adjudicator> {
    inner: Arc<Inner<B, A>>,
}

impl<B: PeerBus, A: Adjudicator> Clone for PerunClient<B, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: PeerBus, A: Adjudicator> PerunClient<B, A> {
    /// Creates a new client with the given transport, adjudicator access and
    /// signing account.
    pub fn new(cfg: ClientConfig, signer: Signer, bus: B, adjudicator: A) -> Result<Self, Error> {
        let (errors, error_stream) = mpsc::unbounded_channel();
        let store: Option<Arc<dyn Store>> = match &cfg.database_path {
            Some(path) => Some(Arc::new(FileStore::open(path.clone())?)),
            None => None,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                alias: cfg.alias,
                bus,
                adjudicator,
                signer,
                registry: Registry::new(),
                handlers: Handlers::default(),
                shutdown: CancellationToken::new(),
                errors,
                error_stream: Mutex::new(Some(error_stream)),
                store: RwLock::new(store),
                seen_proposals: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// The address this client signs with.
    pub fn address(&self) -> Address {
        self.inner.signer.address()
    }

    /// Registers how to reach a peer with the transport.
    pub fn add_peer(&self, peer: Address, host: &str, port: u16) {
        self.inner.bus.add_peer(peer, host, port);
    }

    /// Enables durable snapshots of all channel mutations under `path`.
    pub fn enable_persistence(&self, path: impl Into<PathBuf>) -> Result<(), Error> {
        let store = FileStore::open(path.into())?;
        *self.inner.store.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(store));
        Ok(())
    }

    /// Decision callback for inbound channel proposals. Must be set before
    /// [Self::listen] runs or all proposals are rejected.
    pub fn on_proposal(&self, handler: impl ProposalHandler) {
        *self.inner.handlers.proposal.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(handler));
    }

    /// Decision callback for inbound state updates.
    pub fn on_update(&self, handler: impl UpdateHandler) {
        *self.inner.handlers.update.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(handler));
    }

    /// Invoked once per locally registered handle, for own proposals,
    /// accepted inbound proposals and restored channels alike. The handle is
    /// registered and watchable by the time the callback runs.
    pub fn on_new_channel(&self, callback: impl Fn(Arc<ChannelHandle>) + Send + Sync + 'static) {
        *self.inner.handlers.new_channel.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(callback));
    }

    /// Invoked at most once per channel id per process lifetime, after the
    /// channel was concluded on-chain and retired from the registry.
    pub fn on_concluded(&self, callback: impl Fn(ChannelId) + Send + Sync + 'static) {
        *self.inner.handlers.concluded.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(callback));
    }

    /// Out-of-band errors from autonomous tasks, e.g.
    /// [Error::SettlementFailed] from a dispute watcher. Can be taken once.
    pub fn take_error_stream(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.inner.error_stream.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// The shared inbound listener. Run this in its own task; it terminates
    /// on [Self::shutdown] or when the transport closes.
    ///
    /// Caller contract: decision callbacks run synchronously on this task, so
    /// a long-running callback throttles inbound handling for all channels.
    pub async fn listen(&self) {
        info!(alias = %self.inner.alias, "listener started");
        loop {
            let request = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                request = self.inner.bus.next_request() => request,
            };
            match request {
                Ok(PeerRequest::Proposal { from, proposal, reply }) => {
                    proposal::handle_inbound(&self.inner, from, proposal, reply).await;
                }
                Ok(PeerRequest::InitialSig { from, id, sig, reply }) => {
                    proposal::handle_initial_sig(&self.inner, from, id, sig, reply);
                }
                Ok(PeerRequest::Update { from, update, reply }) => {
                    update::handle_inbound(&self.inner, from, update, reply).await;
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    warn!(alias = %self.inner.alias, error = %e, "inbound receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        info!(alias = %self.inner.alias, "listener stopped");
    }

    /// Proposes a new channel to `peer` and drives the handshake to
    /// completion. On success the returned handle is registered, persisted
    /// and watched.
    pub async fn propose_channel(
        &self,
        peer: Address,
        challenge_duration: u64,
        assets: Vec<Asset>,
        init_balances: Vec<Vec<U256>>,
        timeout: Duration,
    ) -> Result<Arc<ChannelHandle>, Error> {
        proposal::propose(
            &self.inner,
            peer,
            challenge_duration,
            assets,
            init_balances,
            timeout,
        )
        .await
    }

    /// Proposes the balance vector `new_balances` as the next state and waits
    /// for the peer's signed confirmation.
    pub async fn send(
        &self,
        handle: &Arc<ChannelHandle>,
        new_balances: Vec<Vec<U256>>,
        timeout: Duration,
    ) -> Result<State, Error> {
        update::send(&self.inner, handle, new_balances, false, timeout).await
    }

    /// Pays `amount` of asset 0 from us to the peer.
    pub async fn send_payment(
        &self,
        handle: &Arc<ChannelHandle>,
        amount: U256,
        timeout: Duration,
    ) -> Result<State, Error> {
        if amount.is_zero() {
            return Err(Error::InvalidAmount("payment amount must be positive"));
        }
        if handle.params().participants.len() != 2 {
            return Err(Error::InvalidAmount("payments require a bilateral channel"));
        }
        let mut balances = handle.balances();
        let my = handle.part_idx();
        let other = 1 - my;
        let row = balances
            .first_mut()
            .ok_or(Error::InvalidAmount("channel has no assets"))?;
        if row[my] < amount {
            return Err(Error::InvalidAmount("insufficient balance"));
        }
        row[my] = row[my] - amount;
        row[other] = row[other]
            .checked_add(amount)
            .ok_or(Error::InvalidAmount("balance overflow"))?;
        update::send(&self.inner, handle, balances, false, timeout).await
    }

    /// Marks the channel final with one last update. After confirmation every
    /// further `send` fails with [Error::ChannelFinalized] on both sides.
    pub async fn finalize(
        &self,
        handle: &Arc<ChannelHandle>,
        timeout: Duration,
    ) -> Result<State, Error> {
        update::send(&self.inner, handle, handle.balances(), true, timeout).await
    }

    /// Settles the channel on-chain: registers the latest state if needed (or
    /// always, with `force`), concludes, and withdraws our balance. The
    /// dispute watcher retires the handle once it observes the conclusion.
    pub async fn settle(&self, handle: &Arc<ChannelHandle>, force: bool) -> Result<(), Error> {
        self.inner.ensure_live(handle)?;
        let _guard = handle.seq.lock().await;
        let (state, signatures, _) = handle.snapshot();
        let signatures: Vec<Signature> = signatures.into_iter().flatten().collect();
        let req = crate::transport::AdjudicatorReq {
            params: handle.params().clone(),
            state: state.clone(),
            signatures: signatures.clone(),
            part_idx: handle.part_idx(),
        };

        if force || !state.is_final {
            info!(alias = %self.inner.alias, id = ?handle.id(), "registering state on-chain");
            self.inner.adjudicator.register_dispute(req.clone()).await?;
            handle.set_phase(Phase::Disputed);
        }
        self.inner.adjudicator.conclude(req).await?;
        handle.set_phase(Phase::Concluding);
        self.inner.persist_handle(handle)?;

        self.inner
            .adjudicator
            .withdraw(crate::transport::WithdrawReq {
                params: handle.params().clone(),
                state,
                signatures,
                part_idx: handle.part_idx(),
                receiver: self.inner.signer.address(),
            })
            .await?;
        // Marked only after success. The watcher waits on the sequence point
        // we hold before reading the flag, so a failed withdrawal above falls
        // through to its bounded-retry path instead of being skipped.
        handle.withdrawn.store(true, std::sync::atomic::Ordering::SeqCst);
        info!(alias = %self.inner.alias, id = ?handle.id(), "withdrawal submitted");
        Ok(())
    }

    /// Starts the dispute watcher for a handle. Idempotent.
    pub fn watch(&self, handle: &Arc<ChannelHandle>) {
        watcher::ensure_watching(&self.inner, handle);
    }

    /// Cooperative local teardown: stops the watcher and removes the handle
    /// from the registry. The persisted record is kept so a later restore can
    /// resurrect the channel; only on-chain conclusion deletes it.
    pub fn close(&self, handle: &Arc<ChannelHandle>) {
        debug!(alias = %self.inner.alias, id = ?handle.id(), "closing channel handle");
        handle.cancel.cancel();
        self.inner.registry.remove(handle.id());
        handle.set_phase(Phase::Closed);
    }

    /// Rebuilds the registry from persisted records and re-arms watchers.
    /// Idempotent: ids already registered are skipped, so running it twice
    /// cannot create duplicate watchers.
    ///
    /// Peer transport links are not re-dialed here; call [Self::add_peer] for
    /// each restored handle's peer before exchanging updates.
    pub async fn restore(&self, timeout: Duration) -> Result<Vec<Arc<ChannelHandle>>, Error> {
        let store = self
            .inner
            .store()
            .ok_or(Error::Persistence(PersistenceError::NotEnabled))?;
        tokio::time::timeout(timeout, async {
            let mut restored = Vec::new();
            for (id, record) in store.load_all()? {
                if let Some(existing) = self.inner.registry.get(id) {
                    watcher::ensure_watching(&self.inner, &existing);
                    continue;
                }
                let phase = if record.state.is_final {
                    Phase::Concluding
                } else {
                    Phase::Active
                };
                let handle = Arc::new(ChannelHandle::restore(
                    record.params,
                    record.part_idx,
                    record.peer,
                    record.state,
                    record.signatures,
                    phase,
                ));
                self.inner.registry.register(handle.clone(), true)?;
                watcher::ensure_watching(&self.inner, &handle);
                info!(alias = %self.inner.alias, ?id, version = handle.version(), "restored channel");
                self.inner.handlers.notify_new_channel(handle.clone());
                restored.push(handle);
            }
            Ok(restored)
        })
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Read-only registry lookup.
    pub fn channel(&self, id: ChannelId) -> Option<Arc<ChannelHandle>> {
        self.inner.registry.get(id)
    }

    /// Snapshot of all registered channels.
    pub fn channels(&self) -> Vec<Arc<ChannelHandle>> {
        self.inner.registry.list()
    }

    /// Stops the listener and all watcher tasks.
    pub fn shutdown(&self) {
        info!(alias = %self.inner.alias, "shutting down");
        for handle in self.inner.registry.list() {
            handle.cancel.cancel();
        }
        self.inner.shutdown.cancel();
    }
}
