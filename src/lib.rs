//! Client-side orchestration for Perun-style payment channels.
//!
//! This crate keeps the three moving parts of a channel client consistent
//! under concurrency and restarts: off-chain negotiation with peers, on-chain
//! watching of the adjudicator, and durable snapshots of every accepted
//! state. The cryptographic channel protocol itself (state validity rules,
//! dispute arbitration, contract semantics) lives behind the collaborator
//! traits in [transport]; this crate drives it.

pub mod channel;
mod client;
pub mod error;
pub mod persistence;
pub mod proposal;
pub mod registry;
pub mod transport;
pub mod update;
pub mod wallet;
mod watcher;

pub use channel::{
    Address, Asset, ChannelHandle, ChannelId, Hash, Params, Phase, Signature, State, U256,
};
pub use client::{ClientConfig, PerunClient};
pub use error::Error;
