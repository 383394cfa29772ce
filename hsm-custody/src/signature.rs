//! Turning the raw `(r, s)` a token returns into a low-S, recoverable signature.

use crate::error::CustodyError;
use crate::keys::EcPublicKey;
use alloy_primitives::{B256, U256};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

/// Length of a raw `r || s` ECDSA signature over secp256k1.
pub const RAW_SIGNATURE_LEN: usize = 64;

/// Parses the raw `r || s` produced by `CKM_ECDSA`.
pub fn parse_raw_signature(raw: &[u8]) -> Result<Signature, CustodyError> {
    if raw.len() != RAW_SIGNATURE_LEN {
        return Err(CustodyError::MalformedSignature(
            "device signature is not 64 bytes",
        ));
    }
    Signature::from_slice(raw)
        .map_err(|_| CustodyError::MalformedSignature("r or s is out of range"))
}

/// Whether `s` is at most half the curve order.
pub fn is_low_s(signature: &Signature) -> bool {
    signature.normalize_s().is_none()
}

/// Replaces a high `s` by `n - s`. The result verifies under the same key.
pub fn normalize_s(signature: Signature) -> Signature {
    signature.normalize_s().unwrap_or(signature)
}

/// A low-S ECDSA signature with the recovery id that reproduces its signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableSignature {
    signature: Signature,
    recovery_id: RecoveryId,
}

impl RecoverableSignature {
    /// Finds the recovery id under which `signature` over `hash` recovers to
    /// exactly `expected`, trying 0 then 1. Returns `None` if neither does.
    pub fn attach(hash: &B256, signature: Signature, expected: &EcPublicKey) -> Option<Self> {
        let expected = expected.to_uncompressed();
        let recovery_id = [false, true]
            .into_iter()
            .map(|is_y_odd| RecoveryId::new(is_y_odd, false))
            .find(|&recovery_id| {
                VerifyingKey::recover_from_prehash(hash.as_slice(), &signature, recovery_id)
                    .map(|recovered| {
                        recovered.to_encoded_point(false).as_bytes() == expected.as_slice()
                    })
                    .unwrap_or(false)
            })?;
        Some(RecoverableSignature {
            signature,
            recovery_id,
        })
    }

    /// Rebuilds a signature from its components, as found on the wire.
    pub fn from_parts(r: U256, s: U256, y_parity: bool) -> Result<Self, CustodyError> {
        let mut raw = [0u8; RAW_SIGNATURE_LEN];
        raw[..32].copy_from_slice(&r.to_be_bytes::<32>());
        raw[32..].copy_from_slice(&s.to_be_bytes::<32>());
        Ok(RecoverableSignature {
            signature: parse_raw_signature(&raw)?,
            recovery_id: RecoveryId::new(y_parity, false),
        })
    }

    /// The `r` component.
    pub fn r(&self) -> U256 {
        U256::from_be_slice(&self.signature.split_bytes().0)
    }

    /// The `s` component.
    pub fn s(&self) -> U256 {
        U256::from_be_slice(&self.signature.split_bytes().1)
    }

    /// Whether the recovered point has an odd y coordinate; the recovery id
    /// as 0 or 1.
    pub fn y_parity(&self) -> bool {
        self.recovery_id.is_y_odd()
    }

    /// The underlying ECDSA signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// `r || s || v` with `v` in {0, 1}.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..RAW_SIGNATURE_LEN].copy_from_slice(&self.signature.to_bytes());
        bytes[RAW_SIGNATURE_LEN] = self.recovery_id.to_byte();
        bytes
    }

    /// Recovers the signer of `hash`.
    pub fn recover(&self, hash: &B256) -> Result<EcPublicKey, CustodyError> {
        VerifyingKey::recover_from_prehash(hash.as_slice(), &self.signature, self.recovery_id)
            .map(|key| EcPublicKey::from(&key))
            .map_err(|_| CustodyError::MalformedSignature("signature does not recover a key"))
    }
}
