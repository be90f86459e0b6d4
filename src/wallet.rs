//! Account management and creation/verification of (Ethereum) signatures,
//! using the k256 crate (pure-Rust ECDSA).

use std::collections::HashMap;
use std::sync::Mutex;

use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as K256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};
use thiserror::Error;
use uint::hex::FromHex;

use crate::channel::{Address, Hash, Signature};

#[derive(Debug, Clone, Error)]
pub enum WalletError {
    #[error("secret key must start with 0x and be 66 characters long")]
    InvalidSecretFormat,
    #[error("decoding secret key: {0}")]
    InvalidSecretKey(String),
    #[error("signature recovery: {0}")]
    Recovery(String),
    #[error("unknown account {0:?}")]
    UnknownAccount(Address),
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use a serializer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        // Convert the key into an EncodedPoint (on the curve), which has the
        // data we need in bytes [1..]. This panics if the bytes representation
        // of EncodedPoint is not 65 bytes, which is unlikely to change in the
        // dependency.
        let pk_bytes: [u8; 65] = key.to_encoded_point(false).as_bytes().try_into().unwrap();

        // Throw away the first byte, which is not part of the public key. It is
        // added by serialize_uncompressed due to the encoding used.
        let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

/// Holds one account's signing key and derived address.
#[derive(Debug, Clone)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl Signer {
    /// Creates a signer with a fresh random key.
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = loop {
            let bytes: [u8; 32] = rng.gen();
            // from_bytes only fails for values outside the curve order.
            if let Ok(key) = SigningKey::from_bytes(&bytes) {
                break key;
            }
        };
        let addr = key.verifying_key().into();
        Self { key, addr }
    }

    /// Creates a signer from a `0x`-prefixed hex secret key, e.g.
    /// `0x6aeeb7f09e757baa9d3935a042c3d0d46a2eda19e9b676283dce4eaf32e29dc9`.
    pub fn from_secret(secret: &str) -> Result<Self, WalletError> {
        if secret.len() != 66 || &secret[..2] != "0x" {
            return Err(WalletError::InvalidSecretFormat);
        }
        let bytes = <[u8; 32]>::from_hex(&secret[2..])
            .map_err(|e| WalletError::InvalidSecretKey(e.to_string()))?;
        let key = SigningKey::from_bytes(&bytes)
            .map_err(|e| WalletError::InvalidSecretKey(e.to_string()))?;
        let addr = key.verifying_key().into();
        Ok(Self { key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0).unwrap();

        // This Signature type already has the format we need: 65 bytes
        // containing r, s and v in this order. But we still have to add 27 to
        // v for the signature to be valid in the EVM.
        let mut sig_bytes: [u8; 65] = sig.as_bytes().try_into().expect(
            "Unreachable: Signature size doesn't match, something big must have changed in the dependency",
        );
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Signature(sig_bytes)
    }

    pub fn recover_signer(&self, msg: Hash, eth_sig: Signature) -> Result<Address, WalletError> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        // Undo adding the 27, to go back to the format expected below
        let mut sig_bytes: [u8; 65] = eth_sig.0;
        if sig_bytes[64] < 27 {
            return Err(WalletError::Recovery("invalid recovery id".into()));
        }
        sig_bytes[64] -= 27;

        let sig = recoverable::Signature::from_bytes(&sig_bytes)
            .map_err(|e| WalletError::Recovery(e.to_string()))?;

        let verifying_key = sig
            .recover_verifying_key_from_digest_bytes(&hash.0.into())
            .map_err(|e| WalletError::Recovery(e.to_string()))?;
        Ok(verifying_key.into())
    }
}

/// A thread-safe collection of accounts.
///
/// Importing the same secret key twice is safe and returns the same address.
#[derive(Debug, Default)]
pub struct Wallet {
    accounts: Mutex<HashMap<Address, Signer>>,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Imports a secret key and returns the corresponding address.
    pub fn import_account(&self, secret: &str) -> Result<Address, WalletError> {
        let signer = Signer::from_secret(secret)?;
        let addr = signer.address();
        self.lock().entry(addr).or_insert(signer);
        Ok(addr)
    }

    /// Creates a fresh random account and returns its address.
    pub fn create_account<R: rand::Rng + rand::CryptoRng>(&self, rng: &mut R) -> Address {
        let signer = Signer::new(rng);
        let addr = signer.address();
        self.lock().insert(addr, signer);
        addr
    }

    pub fn signer(&self, addr: Address) -> Result<Signer, WalletError> {
        self.lock()
            .get(&addr)
            .cloned()
            .ok_or(WalletError::UnknownAccount(addr))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Address, Signer>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "0x6aeeb7f09e757baa9d3935a042c3d0d46a2eda19e9b676283dce4eaf32e29dc9";

    #[test]
    fn rejects_malformed_secret() {
        assert!(matches!(
            Signer::from_secret("deadbeef"),
            Err(WalletError::InvalidSecretFormat)
        ));
        assert!(matches!(
            Signer::from_secret(&format!("0x{}", "zz".repeat(32))),
            Err(WalletError::InvalidSecretKey(_))
        ));
    }

    #[test]
    fn import_is_idempotent() {
        let wallet = Wallet::new();
        let a = wallet.import_account(TEST_SECRET).unwrap();
        let b = wallet.import_account(TEST_SECRET).unwrap();
        assert_eq!(a, b);
        assert!(wallet.signer(a).is_ok());
    }

    #[test]
    fn sign_and_recover_round_trip() {
        let mut rng = rand::thread_rng();
        let signer = Signer::new(&mut rng);
        let msg = Hash([7; 32]);

        let sig = signer.sign_eth(msg);
        let recovered = signer.recover_signer(msg, sig).unwrap();
        assert_eq!(recovered, signer.address());

        // A different message must not recover to the same address.
        let other = signer.recover_signer(Hash([8; 32]), sig).unwrap();
        assert_ne!(other, signer.address());
    }

    #[test]
    fn secret_derives_stable_address() {
        let a = Signer::from_secret(TEST_SECRET).unwrap().address();
        let b = Signer::from_secret(TEST_SECRET).unwrap().address();
        assert_eq!(a, b);
    }
}
