//! Proposal negotiation: drives outbound proposals to completion and decides
//! inbound proposals via a caller-supplied decision callback, registering the
//! resulting channel exactly once.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha3::{Digest, Sha3_256};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::{
    Address, Asset, ChannelHandle, ChannelId, NonceShare, Params, Phase, Signature, State, U256,
};
use crate::client::Inner;
use crate::error::Error;
use crate::transport::{
    Adjudicator, LedgerChannelProposal, LedgerChannelProposalAcc, PeerBus, ProposalReply,
};
use crate::watcher;

/// Outcome of a [ProposalHandler] decision.
#[derive(Debug, Clone)]
pub enum ProposalDecision {
    Accept,
    Reject { reason: String },
}

/// Decides how to handle incoming channel proposals from peers.
///
/// Runs synchronously on the shared listener task: a long-running
/// implementation throttles inbound handling for all channels.
pub trait ProposalHandler: Send + Sync + 'static {
    fn handle_proposal(&self, proposal: &LedgerChannelProposal) -> ProposalDecision;
}

/// Combine both nonce shares into the channel nonce and build the agreed-upon
/// parameters. Both sides run this with the same inputs and must arrive at
/// the same [Params], and therefore the same channel id.
pub(crate) fn agreed_params(
    proposal: &LedgerChannelProposal,
    acceptor_share: NonceShare,
    acceptor: Address,
) -> Params {
    // Not keccak256: Go-Perun uses SHA3-256 here, probably to be less
    // dependent on Ethereum. We do the same.
    let mut hasher = Sha3_256::new();
    hasher.update(proposal.nonce_share.0);
    hasher.update(acceptor_share.0);
    let nonce = U256::from_big_endian(hasher.finalize().as_slice());

    Params {
        challenge_duration: proposal.challenge_duration,
        nonce,
        participants: vec![proposal.participant, acceptor],
        assets: proposal.assets.clone(),
    }
}

/// Outbound proposal flow: send, await acceptance, verify the acceptor's
/// initial-state signature, register, deliver our own signature, activate.
pub(crate) async fn propose<B: PeerBus, A: Adjudicator>(
    inner: &Arc<Inner<B, A>>,
    peer: Address,
    challenge_duration: u64,
    assets: Vec<Asset>,
    init_balances: Vec<Vec<U256>>,
    deadline: Duration,
) -> Result<Arc<ChannelHandle>, Error> {
    // Scoped so the non-Send ThreadRng is gone before the first await.
    let proposal = {
        let mut rng = rand::thread_rng();
        LedgerChannelProposal {
            proposal_id: rng.gen(),
            challenge_duration,
            nonce_share: rng.gen(),
            assets,
            init_balances,
            participant: inner.signer.address(),
        }
    };
    debug!(alias = %inner.alias, ?peer, "sending channel proposal");

    let reply = timeout(deadline, inner.bus.request_proposal(peer, proposal.clone()))
        .await
        .map_err(|_| Error::Timeout)??;
    let acc = match reply {
        ProposalReply::Accepted(acc) => acc,
        ProposalReply::Rejected { reason } => return Err(Error::Rejected(reason)),
    };

    let params = agreed_params(&proposal, acc.nonce_share, acc.participant);
    let init_state = State::new(&params, proposal.init_balances.clone());
    let digest = init_state.digest();

    let signer = inner.signer.recover_signer(digest, acc.sig)?;
    if signer != acc.participant {
        return Err(Error::InvalidSignature(signer));
    }
    let own_sig = inner.signer.sign_eth(digest);

    let handle = Arc::new(ChannelHandle::new(
        params,
        0,
        peer,
        init_state,
        Phase::Proposed,
    ));
    handle.set_signature(0, own_sig);
    handle.set_signature(1, acc.sig);
    inner.registry.register(handle.clone(), false)?;

    // The peer needs our signature on the initial state for disputes; without
    // the acknowledgement the channel never becomes active on our side.
    let id = handle.id();
    let acked = match timeout(deadline, inner.bus.send_initial_sig(peer, id, own_sig)).await {
        Ok(Ok(acked)) => acked,
        Ok(Err(e)) => {
            inner.registry.remove(id);
            return Err(e.into());
        }
        Err(_) => {
            inner.registry.remove(id);
            return Err(Error::Timeout);
        }
    };
    if !acked {
        inner.registry.remove(id);
        return Err(Error::Rejected("initial signature not accepted".into()));
    }

    handle.set_phase(Phase::Active);
    if let Err(e) = inner.persist_handle(&handle) {
        // Unwind like the earlier failures; an unpersisted channel must not
        // stay registered behind a caller who saw the proposal fail.
        inner.registry.remove(id);
        return Err(e);
    }
    watcher::ensure_watching(inner, &handle);
    info!(alias = %inner.alias, ?id, "channel open");
    inner.handlers.notify_new_channel(handle.clone());
    Ok(handle)
}

/// Inbound proposal flow, run on the shared listener task.
///
/// On accept the handle is registered and persisted *before* the accept reply
/// goes out, so a subsequent `on_new_channel` notification always observes a
/// registered, watchable handle. A replayed proposal id, or a duplicate
/// resolving to an already registered channel id, is rejected at the protocol
/// level.
pub(crate) async fn handle_inbound<B: PeerBus, A: Adjudicator>(
    inner: &Arc<Inner<B, A>>,
    from: Address,
    proposal: LedgerChannelProposal,
    reply: oneshot::Sender<ProposalReply>,
) {
    let Some(handler) = inner.handlers.proposal_handler() else {
        warn!(alias = %inner.alias, "no proposal handler set, rejecting");
        let _ = reply.send(ProposalReply::Rejected {
            reason: "no proposal handler".into(),
        });
        return;
    };

    match handler.handle_proposal(&proposal) {
        ProposalDecision::Reject { reason } => {
            debug!(alias = %inner.alias, ?from, %reason, "proposal rejected by handler");
            let _ = reply.send(ProposalReply::Rejected { reason });
        }
        ProposalDecision::Accept => {
            if !inner.claim_proposal(proposal.proposal_id) {
                debug!(alias = %inner.alias, ?from, "replayed proposal");
                let _ = reply.send(ProposalReply::Rejected {
                    reason: "duplicate proposal".into(),
                });
                return;
            }
            let nonce_share: NonceShare = rand::thread_rng().gen();
            let our_addr = inner.signer.address();
            let params = agreed_params(&proposal, nonce_share, our_addr);
            let init_state = State::new(&params, proposal.init_balances.clone());
            let sig = inner.signer.sign_eth(init_state.digest());

            let handle = Arc::new(ChannelHandle::new(
                params,
                1,
                from,
                init_state,
                Phase::Proposed,
            ));
            handle.set_signature(1, sig);

            if let Err(e) = inner.registry.register(handle.clone(), false) {
                warn!(alias = %inner.alias, id = ?handle.id(), error = %e, "duplicate channel id");
                inner.release_proposal(proposal.proposal_id);
                let _ = reply.send(ProposalReply::Rejected {
                    reason: "channel already registered".into(),
                });
                return;
            }
            if let Err(e) = inner.persist_handle(&handle) {
                warn!(alias = %inner.alias, id = ?handle.id(), error = %e, "persist failed");
                inner.registry.remove(handle.id());
                inner.release_proposal(proposal.proposal_id);
                let _ = reply.send(ProposalReply::Rejected {
                    reason: "persistence failure".into(),
                });
                return;
            }
            handle.set_phase(Phase::Active);

            let _ = reply.send(ProposalReply::Accepted(LedgerChannelProposalAcc {
                proposal_id: proposal.proposal_id,
                nonce_share,
                participant: our_addr,
                sig,
            }));
            watcher::ensure_watching(inner, &handle);
            info!(alias = %inner.alias, id = ?handle.id(), "accepted inbound channel");
            inner.handlers.notify_new_channel(handle);
        }
    }
}

/// Stores the proposer's signature on the initial state, completing the
/// handshake on the acceptor side.
pub(crate) fn handle_initial_sig<B: PeerBus, A: Adjudicator>(
    inner: &Arc<Inner<B, A>>,
    from: Address,
    id: ChannelId,
    sig: Signature,
    reply: oneshot::Sender<bool>,
) {
    let Some(handle) = inner.registry.get(id) else {
        debug!(alias = %inner.alias, ?id, "initial signature for unknown channel");
        let _ = reply.send(false);
        return;
    };
    if handle.peer() != from || handle.version() != 0 {
        let _ = reply.send(false);
        return;
    }
    let digest = handle.state().digest();
    let proposer = handle.params().participants[0];
    match inner.signer.recover_signer(digest, sig) {
        Ok(signer) if signer == proposer => {}
        _ => {
            warn!(alias = %inner.alias, ?id, "invalid initial-state signature");
            let _ = reply.send(false);
            return;
        }
    }
    handle.set_signature(0, sig);
    if let Err(e) = inner.persist_handle(&handle) {
        warn!(alias = %inner.alias, ?id, error = %e, "persisting initial signature failed");
        let _ = reply.send(false);
        return;
    }
    let _ = reply.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreed_params_are_symmetric_and_nonce_share_sensitive() {
        let mut rng = rand::thread_rng();
        let proposal = LedgerChannelProposal {
            proposal_id: rng.gen(),
            challenge_duration: 60,
            nonce_share: rng.gen(),
            assets: vec![Asset::default()],
            init_balances: vec![vec![100.into(), 100.into()]],
            participant: Address([1; 20]),
        };
        let share: NonceShare = rng.gen();
        let acceptor = Address([2; 20]);

        let a = agreed_params(&proposal, share, acceptor);
        let b = agreed_params(&proposal, share, acceptor);
        assert_eq!(a.channel_id(), b.channel_id());

        let other: NonceShare = rng.gen();
        let c = agreed_params(&proposal, other, acceptor);
        assert_ne!(a.channel_id(), c.channel_id());
    }
}
