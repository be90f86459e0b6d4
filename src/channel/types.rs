//! Primitive channel types: fixed-size byte newtypes, 256-bit balances and the
//! channel parameter/state structs exchanged with peers and written to disk.

use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use uint::construct_uint;

use super::Asset;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! bytes_newtype {
    ($T:ident, $N:literal) => {
        #[derive(PartialEq, Eq, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct BytesVisitor;

                impl<'de> serde::de::Visitor<'de> for BytesVisitor {
                    type Value = $T;

                    fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                        write!(f, "{} bytes", $N)
                    }

                    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        let bytes: [u8; $N] = v
                            .try_into()
                            .map_err(|_| E::invalid_length(v.len(), &self))?;
                        Ok($T(bytes))
                    }
                }

                deserializer.deserialize_bytes(BytesVisitor)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
    };
}

bytes_newtype!(Hash, 32);
bytes_newtype!(ChannelId, 32);
bytes_newtype!(Address, 20);

bytes_newtype!(Signature, 65);
impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig: Signature = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

// We could use primitive_types::U256 or ethereum_types::U256 here, too. Both
// serde-serialize to hex strings, which is not what we want for the compact
// persisted records. Since both internally use construct_uint it is easier to
// create our own type and give it a 32-byte big-endian encoding.
construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct U256Visitor;

        impl<'de> serde::de::Visitor<'de> for U256Visitor {
            type Value = U256;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "32 big-endian bytes")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 32 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                Ok(U256::from_big_endian(v))
            }
        }

        deserializer.deserialize_bytes(U256Visitor)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

/// Immutable channel configuration, agreed upon during the proposal handshake.
///
/// The [ChannelId] is derived deterministically from these values, which is
/// what makes two concurrent proposals with identical parameters collide in
/// the registry instead of silently coexisting.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Params {
    pub challenge_duration: u64,
    pub nonce: U256,
    /// Participant addresses, proposer first.
    pub participants: Vec<Address>,
    pub assets: Vec<Asset>,
}

impl Params {
    /// Derives the globally unique channel identifier from the parameters.
    ///
    /// The encoding is length-prefixed so that no two distinct parameter sets
    /// share an identifier.
    pub fn channel_id(&self) -> ChannelId {
        let mut hasher = Keccak256::new();
        hasher.update(self.challenge_duration.to_be_bytes());
        let mut nonce = [0u8; 32];
        self.nonce.to_big_endian(&mut nonce);
        hasher.update(nonce);
        hasher.update((self.participants.len() as u64).to_be_bytes());
        for participant in &self.participants {
            hasher.update(participant.0);
        }
        hasher.update((self.assets.len() as u64).to_be_bytes());
        for asset in &self.assets {
            let mut chain_id = [0u8; 32];
            asset.chain_id.to_big_endian(&mut chain_id);
            hasher.update(chain_id);
            hasher.update(asset.holder.0);
        }
        ChannelId(hasher.finalize().into())
    }
}

/// Complete off-chain state of a channel at one version.
///
/// `id` and `version` are private so new states can only be created through
/// [State::new] and [State::make_next], which forces version monotonicity at
/// compile time instead of via runtime checks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct State {
    id: ChannelId,
    version: u64,
    /// Balance per asset per participant: `balances[asset][participant]`.
    pub balances: Vec<Vec<U256>>,
    pub is_final: bool,
}

impl State {
    pub fn new(params: &Params, init_balances: Vec<Vec<U256>>) -> Self {
        State {
            id: params.channel_id(),
            version: 0,
            balances: init_balances,
            is_final: false,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Create the candidate successor of this state, with the version already
    /// incremented. Balances and finality flag start out unchanged.
    pub fn make_next(&self) -> Self {
        State {
            id: self.id,
            version: self.version + 1,
            balances: self.balances.clone(),
            is_final: self.is_final,
        }
    }

    /// Canonical digest of the state, used for signing and verification.
    pub fn digest(&self) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(self.id.0);
        hasher.update(self.version.to_be_bytes());
        hasher.update((self.balances.len() as u64).to_be_bytes());
        for asset_balances in &self.balances {
            hasher.update((asset_balances.len() as u64).to_be_bytes());
            for balance in asset_balances {
                let mut bytes = [0u8; 32];
                balance.to_big_endian(&mut bytes);
                hasher.update(bytes);
            }
        }
        hasher.update([self.is_final as u8]);
        Hash(hasher.finalize().into())
    }

    /// Sum of all participant balances for one asset. `None` on overflow.
    pub fn total_balance(&self, asset: usize) -> Option<U256> {
        self.balances
            .get(asset)?
            .iter()
            .try_fold(U256::zero(), |acc, b| acc.checked_add(*b))
    }
}

/// Lifecycle phase of a channel handle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Proposed,
    Active,
    Disputed,
    Concluding,
    Closed,
}
