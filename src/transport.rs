//! Collaborator interfaces to the outside world: the peer message bus and the
//! on-chain adjudicator. The wire bit-layout is owned by the implementations;
//! this crate only defines the request/response message shapes.

use core::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{
    Address, Asset, ChannelId, Hash, NonceShare, Params, PartIdx, Signature, State, U256,
};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("connection closed")]
    Closed,
    #[error("transport failure: {0}")]
    Other(String),
}

/// Channel configuration offered to a peer (also exchanged over the network).
#[derive(Debug, Clone)]
pub struct LedgerChannelProposal {
    pub proposal_id: Hash,
    pub challenge_duration: u64,
    pub nonce_share: NonceShare,
    pub assets: Vec<Asset>,
    /// `init_balances[asset][participant]`, proposer first.
    pub init_balances: Vec<Vec<U256>>,
    /// The proposer's channel participant address.
    pub participant: Address,
}

/// Sent when a participant accepts a proposed channel.
///
/// Carries the acceptor's nonce share and its signature on the initial state,
/// which the acceptor can already compute because it knows both shares.
#[derive(Debug, Clone)]
pub struct LedgerChannelProposalAcc {
    pub proposal_id: Hash,
    pub nonce_share: NonceShare,
    pub participant: Address,
    pub sig: Signature,
}

#[derive(Debug, Clone)]
pub enum ProposalReply {
    Accepted(LedgerChannelProposalAcc),
    Rejected { reason: String },
}

/// A proposed state update, signed by the acting participant.
#[derive(Debug, Clone)]
pub struct LedgerChannelUpdate {
    pub state: State,
    pub actor_idx: PartIdx,
    pub sig: Signature,
}

#[derive(Debug, Clone)]
pub struct LedgerChannelUpdateAccepted {
    pub channel: ChannelId,
    pub version: u64,
    pub sig: Signature,
}

#[derive(Debug, Clone)]
pub enum UpdateReply {
    Accepted(LedgerChannelUpdateAccepted),
    Rejected {
        id: ChannelId,
        version: u64,
        reason: String,
    },
}

/// An inbound request from a peer, paired with a one-shot reply channel.
#[derive(Debug)]
pub enum PeerRequest {
    Proposal {
        from: Address,
        proposal: LedgerChannelProposal,
        reply: oneshot::Sender<ProposalReply>,
    },
    /// The proposer's signature on the initial state, completing the
    /// handshake on the acceptor side.
    InitialSig {
        from: Address,
        id: ChannelId,
        sig: Signature,
        reply: oneshot::Sender<bool>,
    },
    Update {
        from: Address,
        update: LedgerChannelUpdate,
        reply: oneshot::Sender<UpdateReply>,
    },
}

/// Network transport to channel peers.
///
/// Requests are framed by channel id + version by the implementation; replies
/// resolve the returned futures. One implementation instance serves all
/// channels of a client.
#[async_trait]
pub trait PeerBus: Send + Sync + Debug + 'static {
    async fn request_proposal(
        &self,
        peer: Address,
        proposal: LedgerChannelProposal,
    ) -> Result<ProposalReply, TransportError>;

    async fn send_initial_sig(
        &self,
        peer: Address,
        id: ChannelId,
        sig: Signature,
    ) -> Result<bool, TransportError>;

    async fn request_update(
        &self,
        peer: Address,
        update: LedgerChannelUpdate,
    ) -> Result<UpdateReply, TransportError>;

    /// Next inbound request from any peer. The shared listener loops on this.
    async fn next_request(&self) -> Result<PeerRequest, TransportError>;

    /// Register how to reach a peer. Required before proposing to it and
    /// after a restart before restored channels can exchange updates.
    fn add_peer(&self, peer: Address, host: &str, port: u16);
}

/// Events observed on the adjudicator contract for one channel.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A state was registered on-chain (dispute path). `version` is the
    /// version of the registered state.
    Registered { id: ChannelId, version: u64 },
    /// The channel was concluded on-chain.
    Concluded { id: ChannelId },
}

/// A fully signed state as submitted to the adjudicator.
#[derive(Debug, Clone)]
pub struct AdjudicatorReq {
    pub params: Params,
    pub state: State,
    pub signatures: Vec<Signature>,
    pub part_idx: PartIdx,
}

#[derive(Debug, Clone)]
pub struct WithdrawReq {
    pub params: Params,
    pub state: State,
    pub signatures: Vec<Signature>,
    pub part_idx: PartIdx,
    pub receiver: Address,
}

/// On-chain side of the channel protocol engine.
///
/// Dispute arbitration itself lives behind this trait; the watcher only
/// decides *when* to call which operation.
#[async_trait]
pub trait Adjudicator: Send + Sync + Debug + 'static {
    async fn subscribe_conclusion(
        &self,
        id: ChannelId,
    ) -> Result<mpsc::Receiver<ChainEvent>, TransportError>;

    async fn register_dispute(&self, req: AdjudicatorReq) -> Result<(), TransportError>;

    async fn conclude(&self, req: AdjudicatorReq) -> Result<(), TransportError>;

    async fn withdraw(&self, req: WithdrawReq) -> Result<(), TransportError>;
}
