use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use super::{Params, PartIdx, Phase, Signature, State};
use crate::channel::{Address, ChannelId};

/// The live, in-memory representation of one channel.
///
/// Exactly one handle exists per [ChannelId] within a process; the registry
/// owns it and hands out `Arc` references. All state mutation goes through the
/// crate-internal methods here, never through direct field writes, so that
/// concurrent readers always observe a consistent (state, signatures, phase)
/// triple.
#[derive(Debug)]
pub struct ChannelHandle {
    params: Params,
    part_idx: PartIdx,
    peer: Address,
    core: Mutex<Core>,
    /// Per-channel sequence point: serializes outbound sends and inbound
    /// applies so concurrent updates can never interleave into racing version
    /// proposals.
    pub(crate) seq: tokio::sync::Mutex<()>,
    pub(crate) watching: AtomicBool,
    /// Set once this side's withdrawal has completed on-chain.
    pub(crate) withdrawn: AtomicBool,
    pub(crate) concluded_notified: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

#[derive(Debug)]
struct Core {
    state: State,
    signatures: Vec<Option<Signature>>,
    phase: Phase,
}

impl ChannelHandle {
    pub(crate) fn new(
        params: Params,
        part_idx: PartIdx,
        peer: Address,
        state: State,
        phase: Phase,
    ) -> Self {
        let participants = params.participants.len();
        debug_assert!(part_idx < participants);
        ChannelHandle {
            params,
            part_idx,
            peer,
            core: Mutex::new(Core {
                state,
                signatures: vec![None; participants],
                phase,
            }),
            seq: tokio::sync::Mutex::new(()),
            watching: AtomicBool::new(false),
            withdrawn: AtomicBool::new(false),
            concluded_notified: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Rebuild a handle from a persisted record.
    pub(crate) fn restore(
        params: Params,
        part_idx: PartIdx,
        peer: Address,
        state: State,
        signatures: Vec<Option<Signature>>,
        phase: Phase,
    ) -> Self {
        let handle = Self::new(params, part_idx, peer, state, phase);
        handle.lock().signatures = signatures;
        handle
    }

    pub fn id(&self) -> ChannelId {
        self.params.channel_id()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Our index in the participant list (`0` is the proposer).
    pub fn part_idx(&self) -> PartIdx {
        self.part_idx
    }

    /// Wire identity of the counterparty.
    pub fn peer(&self) -> Address {
        self.peer
    }

    pub fn state(&self) -> State {
        self.lock().state.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().state.version()
    }

    pub fn is_final(&self) -> bool {
        self.lock().state.is_final
    }

    pub fn balances(&self) -> Vec<Vec<super::U256>> {
        self.lock().state.balances.clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    pub(crate) fn set_signature(&self, part_idx: PartIdx, sig: Signature) {
        self.lock().signatures[part_idx] = Some(sig);
    }

    /// Atomically replace state and signatures. Callers must hold `seq` and
    /// have persisted the new state already.
    pub(crate) fn commit_state(&self, state: State, signatures: Vec<Option<Signature>>) {
        let mut core = self.lock();
        core.state = state;
        core.signatures = signatures;
    }

    pub(crate) fn snapshot(&self) -> (State, Vec<Option<Signature>>, Phase) {
        let core = self.lock();
        (core.state.clone(), core.signatures.clone(), core.phase)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}
