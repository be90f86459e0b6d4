//! The update dispatcher: validates, arbitrates and applies state updates,
//! outbound and inbound. Updates on one channel are serialized through the
//! handle's sequence point; state is persisted before either side treats it
//! as confirmed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::{Address, ChannelHandle, PartIdx, State, U256};
use crate::client::Inner;
use crate::error::{Error, TransitionViolation};
use crate::transport::{
    Adjudicator, LedgerChannelUpdate, LedgerChannelUpdateAccepted, PeerBus, UpdateReply,
};

/// Outcome of an [UpdateHandler] decision.
#[derive(Debug, Clone)]
pub enum UpdateDecision {
    Accept,
    Reject { reason: String },
}

/// Decides how to handle incoming state updates.
///
/// Only invoked for protocol-conforming updates; version or conservation
/// violations are rejected before the callback runs. Runs synchronously on
/// the shared listener task.
pub trait UpdateHandler: Send + Sync + 'static {
    fn handle_update(&self, current: &State, proposed: &State, actor: PartIdx) -> UpdateDecision;
}

/// Checks that `proposed` is a valid direct successor of `current`.
///
/// Balance conservation is the payment-channel transition rule: the per-asset
/// sum over all participants must not change.
pub(crate) fn check_transition(current: &State, proposed: &State) -> Result<(), Error> {
    if current.is_final {
        return Err(Error::ChannelFinalized);
    }
    if proposed.channel_id() != current.channel_id() {
        return Err(Error::InvalidTransition(TransitionViolation::ChannelIdMismatch));
    }
    if proposed.version() != current.version() + 1 {
        return Err(Error::InvalidTransition(TransitionViolation::VersionNotNext));
    }
    if proposed.balances.len() != current.balances.len()
        || proposed
            .balances
            .iter()
            .zip(&current.balances)
            .any(|(p, c)| p.len() != c.len())
    {
        return Err(Error::InvalidTransition(TransitionViolation::BalanceShapeMismatch));
    }
    for asset in 0..current.balances.len() {
        let before = current.total_balance(asset);
        let after = proposed.total_balance(asset);
        if before.is_none() || before != after {
            return Err(Error::InvalidTransition(TransitionViolation::BalancesNotConserved));
        }
    }
    Ok(())
}

/// Outbound update: propose `new_balances` (and optionally finality) as the
/// next state, await the peer's signed confirmation, persist, then commit.
///
/// A timeout or rejection leaves the handle at its prior confirmed version.
pub(crate) async fn send<B: PeerBus, A: Adjudicator>(
    inner: &Arc<Inner<B, A>>,
    handle: &Arc<ChannelHandle>,
    new_balances: Vec<Vec<U256>>,
    make_final: bool,
    deadline: Duration,
) -> Result<State, Error> {
    inner.ensure_live(handle)?;
    let _guard = handle.seq.lock().await;

    let current = handle.state();
    let mut candidate = current.make_next();
    candidate.balances = new_balances;
    if make_final {
        candidate.is_final = true;
    }
    check_transition(&current, &candidate)?;

    let digest = candidate.digest();
    let own_sig = inner.signer.sign_eth(digest);
    debug!(alias = %inner.alias, id = ?handle.id(), version = candidate.version(), "proposing update");

    let reply = timeout(
        deadline,
        inner.bus.request_update(
            handle.peer(),
            LedgerChannelUpdate {
                state: candidate.clone(),
                actor_idx: handle.part_idx(),
                sig: own_sig,
            },
        ),
    )
    .await
    .map_err(|_| Error::Timeout)??;

    let acc = match reply {
        UpdateReply::Accepted(acc) => acc,
        UpdateReply::Rejected { reason, .. } => return Err(Error::Rejected(reason)),
    };
    if acc.channel != candidate.channel_id() || acc.version != candidate.version() {
        return Err(Error::Rejected("acceptance for a different state".into()));
    }

    let peer_idx = 1 - handle.part_idx();
    let signer = inner.signer.recover_signer(digest, acc.sig)?;
    if signer != handle.params().participants[peer_idx] {
        return Err(Error::InvalidSignature(signer));
    }

    // CAS on version: the sequence point rules out interleaving, this guards
    // against commits that slipped in before the lock was taken.
    if handle.version() != current.version() {
        return Err(Error::StaleVersion);
    }

    let mut signatures = vec![None; handle.params().participants.len()];
    signatures[handle.part_idx()] = Some(own_sig);
    signatures[peer_idx] = Some(acc.sig);

    // Durable before committed: a crash after this point replays the new
    // state from disk instead of silently dropping a version the peer has
    // already signed.
    inner.persist_state(handle, &candidate, &signatures, handle.phase())?;
    handle.commit_state(candidate.clone(), signatures);
    info!(alias = %inner.alias, id = ?handle.id(), version = candidate.version(), "update confirmed");
    Ok(candidate)
}

/// Inbound update flow, run on the shared listener task.
pub(crate) async fn handle_inbound<B: PeerBus, A: Adjudicator>(
    inner: &Arc<Inner<B, A>>,
    from: Address,
    update: LedgerChannelUpdate,
    reply: oneshot::Sender<UpdateReply>,
) {
    let id = update.state.channel_id();
    let version = update.state.version();
    let reject = |reason: String| UpdateReply::Rejected { id, version, reason };

    let Some(handle) = inner.registry.get(id) else {
        let _ = reply.send(reject("unknown channel".into()));
        return;
    };
    if handle.peer() != from {
        let _ = reply.send(reject("update from non-participant".into()));
        return;
    }
    // try_lock instead of lock: if our own outbound send holds the sequence
    // point while the peer proposes concurrently, blocking here would
    // deadlock the two listeners against each other. The losing side gets a
    // rejection and retries on the new state.
    let Ok(_guard) = handle.seq.try_lock() else {
        let _ = reply.send(reject("concurrent update in progress".into()));
        return;
    };

    let current = handle.state();
    if let Err(e) = check_transition(&current, &update.state) {
        debug!(alias = %inner.alias, ?id, version, error = %e, "rejecting non-conforming update");
        let _ = reply.send(reject(e.to_string()));
        return;
    }
    let participants = &handle.params().participants;
    if update.actor_idx >= participants.len() {
        let _ = reply.send(reject("actor index out of range".into()));
        return;
    }
    let digest = update.state.digest();
    match inner.signer.recover_signer(digest, update.sig) {
        Ok(signer) if signer == participants[update.actor_idx] => {}
        _ => {
            let _ = reply.send(reject("invalid signature".into()));
            return;
        }
    }

    let Some(handler) = inner.handlers.update_handler() else {
        let _ = reply.send(reject("no update handler".into()));
        return;
    };
    match handler.handle_update(&current, &update.state, update.actor_idx) {
        UpdateDecision::Reject { reason } => {
            debug!(alias = %inner.alias, ?id, version, %reason, "update rejected by handler");
            let _ = reply.send(reject(reason));
        }
        UpdateDecision::Accept => {
            let own_sig = inner.signer.sign_eth(digest);
            let mut signatures = vec![None; participants.len()];
            signatures[update.actor_idx] = Some(update.sig);
            signatures[handle.part_idx()] = Some(own_sig);

            // State must be durable before the peer observes acceptance; a
            // crash after the reply would otherwise lose a state the peer
            // believes is confirmed.
            if let Err(e) =
                inner.persist_state(&handle, &update.state, &signatures, handle.phase())
            {
                warn!(alias = %inner.alias, ?id, version, error = %e, "persist failed, rejecting");
                let _ = reply.send(reject("persistence failure".into()));
                return;
            }
            handle.commit_state(update.state.clone(), signatures);
            info!(alias = %inner.alias, ?id, version, is_final = update.state.is_final, "update accepted");
            let _ = reply.send(UpdateReply::Accepted(LedgerChannelUpdateAccepted {
                channel: id,
                version,
                sig: own_sig,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Asset, Params};

    fn test_state() -> State {
        let params = Params {
            challenge_duration: 60,
            nonce: 7.into(),
            participants: vec![Address([1; 20]), Address([2; 20])],
            assets: vec![Asset::default()],
        };
        State::new(&params, vec![vec![100.into(), 100.into()]])
    }

    #[test]
    fn accepts_conserving_successor() {
        let current = test_state();
        let mut next = current.make_next();
        next.balances = vec![vec![99.into(), 101.into()]];
        assert!(check_transition(&current, &next).is_ok());
    }

    #[test]
    fn rejects_skipped_version() {
        let current = test_state();
        let next = current.make_next().make_next();
        assert!(matches!(
            check_transition(&current, &next),
            Err(Error::InvalidTransition(TransitionViolation::VersionNotNext))
        ));
    }

    #[test]
    fn rejects_unconserved_balances() {
        let current = test_state();
        let mut next = current.make_next();
        next.balances = vec![vec![100.into(), 101.into()]];
        assert!(matches!(
            check_transition(&current, &next),
            Err(Error::InvalidTransition(TransitionViolation::BalancesNotConserved))
        ));
    }

    #[test]
    fn rejects_balance_shape_change() {
        let current = test_state();
        let mut next = current.make_next();
        next.balances = vec![vec![200.into()]];
        assert!(matches!(
            check_transition(&current, &next),
            Err(Error::InvalidTransition(TransitionViolation::BalanceShapeMismatch))
        ));
    }

    #[test]
    fn rejects_any_update_after_final() {
        let current = {
            let mut s = test_state();
            s.is_final = true;
            s
        };
        let next = current.make_next();
        assert!(matches!(
            check_transition(&current, &next),
            Err(Error::ChannelFinalized)
        ));
    }
}
