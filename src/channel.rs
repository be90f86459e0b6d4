mod handle;
mod types;

use serde::{Deserialize, Serialize};

pub use handle::ChannelHandle;
pub use types::{Address, ChannelId, Hash, Params, Phase, Signature, State, U256};

/// Index of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type PartIdx = usize;

/// The random share each participant contributes to the channel nonce.
///
/// The shares are combined into a single [U256] using SHA3-256 during the
/// proposal handshake.
pub type NonceShare = Hash;

/// Uniquely identifies an asset by blockchain + asset holder contract.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq)]
pub struct Asset {
    pub chain_id: U256,
    pub holder: Address,
}
