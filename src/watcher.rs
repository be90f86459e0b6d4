//! The dispute watcher: one long-lived task per active channel that observes
//! the adjudicator, reacts to stale on-chain registrations with the latest
//! local state, and retires the channel once it is concluded on-chain.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channel::{ChannelHandle, Phase, Signature};
use crate::client::Inner;
use crate::error::Error;
use crate::transport::{Adjudicator, AdjudicatorReq, ChainEvent, PeerBus, WithdrawReq};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Bounded number of submission attempts before settlement failure is
/// surfaced out-of-band.
const SUBMIT_ATTEMPTS: u32 = 3;

/// Spawns the dispute watcher for a handle unless one is already running.
pub(crate) fn ensure_watching<B: PeerBus, A: Adjudicator>(
    inner: &Arc<Inner<B, A>>,
    handle: &Arc<ChannelHandle>,
) {
    if handle.watching.swap(true, Ordering::SeqCst) {
        return;
    }
    let inner = inner.clone();
    let handle = handle.clone();
    tokio::spawn(async move {
        run(inner, handle).await;
    });
}

async fn run<B: PeerBus, A: Adjudicator>(inner: Arc<Inner<B, A>>, handle: Arc<ChannelHandle>) {
    let id = handle.id();
    debug!(alias = %inner.alias, ?id, "watcher started");
    let mut backoff = INITIAL_BACKOFF;

    'subscribe: loop {
        let subscription = tokio::select! {
            _ = handle.cancel.cancelled() => break 'subscribe,
            _ = inner.shutdown.cancelled() => break 'subscribe,
            sub = inner.adjudicator.subscribe_conclusion(id) => sub,
        };
        let mut events = match subscription {
            Ok(events) => {
                backoff = INITIAL_BACKOFF;
                events
            }
            Err(e) => {
                warn!(alias = %inner.alias, ?id, error = %e, "conclusion subscription failed");
                if sleep_or_cancelled(&inner, &handle, backoff).await {
                    break 'subscribe;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue 'subscribe;
            }
        };

        loop {
            let event = tokio::select! {
                _ = handle.cancel.cancelled() => break 'subscribe,
                _ = inner.shutdown.cancelled() => break 'subscribe,
                event = events.recv() => event,
            };
            match event {
                None => {
                    warn!(alias = %inner.alias, ?id, "conclusion event stream closed");
                    if sleep_or_cancelled(&inner, &handle, backoff).await {
                        break 'subscribe;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'subscribe;
                }
                Some(ChainEvent::Registered { version, .. }) => {
                    if version < handle.version() {
                        react_to_dispute(&inner, &handle).await;
                    }
                }
                Some(ChainEvent::Concluded { .. }) => {
                    conclude(&inner, &handle).await;
                    break 'subscribe;
                }
            }
        }
    }
    debug!(alias = %inner.alias, ?id, "watcher stopped");
}

/// Sleeps for `duration` unless cancelled first. Returns true on cancel.
async fn sleep_or_cancelled<B: PeerBus, A: Adjudicator>(
    inner: &Inner<B, A>,
    handle: &ChannelHandle,
    duration: Duration,
) -> bool {
    tokio::select! {
        _ = handle.cancel.cancelled() => true,
        _ = inner.shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// A stale (lower-version) state was registered on-chain. Respond by
/// registering the locally known latest state; the actual arbitration is the
/// adjudicator's concern.
async fn react_to_dispute<B: PeerBus, A: Adjudicator>(
    inner: &Arc<Inner<B, A>>,
    handle: &Arc<ChannelHandle>,
) {
    let id = handle.id();
    handle.set_phase(Phase::Disputed);
    let (state, signatures, _) = handle.snapshot();
    info!(alias = %inner.alias, ?id, version = state.version(), "stale on-chain state, registering local state");

    let req = AdjudicatorReq {
        params: handle.params().clone(),
        state,
        signatures: signatures.into_iter().flatten().collect(),
        part_idx: handle.part_idx(),
    };
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=SUBMIT_ATTEMPTS {
        match inner.adjudicator.register_dispute(req.clone()).await {
            Ok(()) => return,
            Err(e) => {
                warn!(alias = %inner.alias, ?id, attempt, error = %e, "dispute registration failed");
                if sleep_or_cancelled(inner, handle, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
    error!(alias = %inner.alias, ?id, "giving up on dispute registration");
    let _ = inner.errors.send(Error::DisputeRegistrationFailed {
        id,
        attempts: SUBMIT_ATTEMPTS,
    });
}

/// The channel was concluded on-chain: withdraw our funds if we did not
/// already initiate settlement, then retire the handle.
async fn conclude<B: PeerBus, A: Adjudicator>(
    inner: &Arc<Inner<B, A>>,
    handle: &Arc<ChannelHandle>,
) {
    let id = handle.id();

    // A conclusion for a channel that is no longer registered is a no-op.
    if inner.registry.get(id).is_none() {
        debug!(alias = %inner.alias, ?id, "conclusion for unregistered channel, ignoring");
        handle.cancel.cancel();
        return;
    }
    handle.set_phase(Phase::Concluding);

    // A caller-initiated settle holds the sequence point across conclude and
    // withdraw, so the withdrawn flag is final once the lock is ours.
    let _guard = handle.seq.lock().await;
    if !handle.withdrawn.load(Ordering::SeqCst) {
        let (state, signatures, _) = handle.snapshot();
        let signatures: Vec<Signature> = signatures.into_iter().flatten().collect();
        let req = WithdrawReq {
            params: handle.params().clone(),
            state,
            signatures,
            part_idx: handle.part_idx(),
            receiver: inner.signer.address(),
        };
        let mut backoff = INITIAL_BACKOFF;
        let mut withdrawn = false;
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match inner.adjudicator.withdraw(req.clone()).await {
                Ok(()) => {
                    withdrawn = true;
                    break;
                }
                Err(e) => {
                    warn!(alias = %inner.alias, ?id, attempt, error = %e, "withdrawal failed");
                    if sleep_or_cancelled(inner, handle, backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        if !withdrawn {
            // Keep the handle registered and the record on disk so a restart
            // can retry the withdrawal; the caller learns out-of-band.
            error!(alias = %inner.alias, ?id, "settlement failed, keeping channel for retry");
            let _ = inner.errors.send(Error::SettlementFailed {
                id,
                attempts: SUBMIT_ATTEMPTS,
            });
            return;
        }
    }

    inner.registry.remove(id);
    if let Some(store) = inner.store() {
        if let Err(e) = store.delete(id) {
            warn!(alias = %inner.alias, ?id, error = %e, "deleting persisted record failed");
        }
    }
    handle.set_phase(Phase::Closed);
    handle.cancel.cancel();
    info!(alias = %inner.alias, ?id, "channel concluded");
    if !handle.concluded_notified.swap(true, Ordering::SeqCst) {
        inner.handlers.notify_concluded(id);
    }
}
