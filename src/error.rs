use thiserror::Error;

use crate::channel::{Address, ChannelId};
use crate::persistence::PersistenceError;
use crate::transport::TransportError;
use crate::wallet::WalletError;

/// Everything that can go wrong while orchestrating a channel.
#[derive(Debug, Error)]
pub enum Error {
    /// A handle for this channel id is already registered.
    #[error("channel {0:?} already registered")]
    Conflict(ChannelId),

    /// A blocking cross-party operation did not complete within its deadline.
    /// Local state is left at the last confirmed version.
    #[error("operation timed out")]
    Timeout,

    /// The peer (or its decision callback) rejected the proposal or update.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// The handle's version moved while an outbound update was in flight.
    /// The caller may rebuild the update on the new state and retry.
    #[error("state version changed concurrently")]
    StaleVersion,

    /// A state transition that violates the channel rules. Rejected locally
    /// without consulting the decision callback.
    #[error("invalid state transition: {0}")]
    InvalidTransition(TransitionViolation),

    /// The current state is final; no further off-chain updates are possible.
    #[error("channel state is final")]
    ChannelFinalized,

    /// The channel is no longer present in the registry.
    #[error("channel is closed")]
    ChannelClosed,

    /// A signature that does not match the expected participant.
    #[error("invalid signature, recovered signer {0:?}")]
    InvalidSignature(Address),

    /// An argument outside the domain of the operation, e.g. a zero payment.
    #[error("invalid amount: {0}")]
    InvalidAmount(&'static str),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Settlement gave up after bounded retries. Surfaced out-of-band on the
    /// client error stream; the channel stays registered so a later restore
    /// can retry the withdrawal.
    #[error("settlement of channel {id:?} failed after {attempts} attempts")]
    SettlementFailed { id: ChannelId, attempts: u32 },

    /// Submitting the latest state in reaction to a stale on-chain
    /// registration gave up after bounded retries. Surfaced out-of-band on
    /// the client error stream; the channel stays registered.
    #[error("dispute registration for channel {id:?} failed after {attempts} attempts")]
    DisputeRegistrationFailed { id: ChannelId, attempts: u32 },

    /// Durable write or read failed. The triggering operation is aborted and
    /// the handle stays at its last durably-confirmed state.
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),
}

/// The specific rule an inbound or outbound state transition violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionViolation {
    #[error("channel id mismatch")]
    ChannelIdMismatch,
    #[error("version is not current + 1")]
    VersionNotNext,
    #[error("balance shape changed")]
    BalanceShapeMismatch,
    #[error("balances not conserved")]
    BalancesNotConserved,
}
