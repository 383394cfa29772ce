//! Address derivation.

use crate::keys::EcPublicKey;
use alloy_primitives::{keccak256, Address};
use serde::{Deserialize, Serialize};

/// The account address of a public key: the low 20 bytes of the Keccak-256
/// hash of `x || y`.
pub fn derive_address(key: &EcPublicKey) -> Address {
    let point = key.to_uncompressed();
    let hash = keccak256(&point[1..]);
    Address::from_slice(&hash[12..])
}

/// An address, with the label of the slot holding its key when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledAddress {
    /// The account address.
    pub address: Address,
    /// The slot label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl LabeledAddress {
    /// An address bound to `label`.
    pub fn new(address: Address, label: impl Into<String>) -> Self {
        Self {
            address,
            label: Some(label.into()),
        }
    }

    /// An address with no label attached.
    pub fn unlabeled(address: Address) -> Self {
        Self {
            address,
            label: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use k256::ecdsa::SigningKey;

    fn key(secret: u8) -> EcPublicKey {
        let mut bytes = [0u8; 32];
        bytes[31] = secret;
        EcPublicKey::from(SigningKey::from_slice(&bytes).unwrap().verifying_key())
    }

    #[test]
    fn derives_known_addresses() {
        assert_eq!(
            derive_address(&key(1)),
            address!("7E5F4552091A69125d5DfCb7b8C2659029395Bdf")
        );
        assert_eq!(
            derive_address(&key(2)).to_string(),
            "0x2B5AD5c4795c026514f8317c7a215E218DcCD6cF"
        );
    }

    #[test]
    fn serializes_without_missing_label() {
        let address = derive_address(&key(1));
        let json = serde_json::to_value(LabeledAddress::unlabeled(address)).unwrap();
        assert!(json.get("label").is_none());

        let labeled = LabeledAddress::new(address, "treasury-1");
        let json = serde_json::to_string(&labeled).unwrap();
        assert_eq!(
            serde_json::from_str::<LabeledAddress>(&json).unwrap(),
            labeled
        );
    }
}
