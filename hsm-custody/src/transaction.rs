//! Legacy EVM transactions, signed under EIP-155.

use crate::address::derive_address;
use crate::error::CustodyError;
use crate::signature::RecoverableSignature;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{BufMut, Decodable, Encodable, Header, EMPTY_STRING_CODE};
use serde::{Deserialize, Serialize};

const EIP155_V_OFFSET: u64 = 35;

/// Largest chain id whose `v = chain_id * 2 + 36` still fits a `u64`.
pub const MAX_CHAIN_ID: u64 = (u64::MAX - EIP155_V_OFFSET - 1) / 2;

/// Checks that `chain_id` can be encoded in an EIP-155 `v`.
pub fn validate_chain_id(chain_id: u64) -> Result<(), CustodyError> {
    if chain_id == 0 || chain_id > MAX_CHAIN_ID {
        return Err(CustodyError::InvalidChainId(chain_id));
    }
    Ok(())
}

/// The fields of a legacy transaction, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    /// Sender account nonce.
    pub nonce: u64,
    /// Price per unit of gas, in wei.
    pub gas_price: U256,
    /// Gas limit.
    pub gas_limit: u64,
    /// Recipient; `None` creates a contract.
    #[serde(default)]
    pub to: Option<Address>,
    /// Amount transferred, in wei.
    pub value: U256,
    /// Call data.
    #[serde(default)]
    pub data: Bytes,
}

fn to_length(to: &Option<Address>) -> usize {
    to.as_ref().map_or(1, Encodable::length)
}

fn encode_to(to: &Option<Address>, out: &mut dyn BufMut) {
    match to {
        Some(address) => address.encode(out),
        None => out.put_u8(EMPTY_STRING_CODE),
    }
}

fn decode_to(buf: &mut &[u8]) -> alloy_rlp::Result<Option<Address>> {
    match buf.first() {
        Some(&EMPTY_STRING_CODE) => {
            *buf = &buf[1..];
            Ok(None)
        }
        _ => Address::decode(buf).map(Some),
    }
}

impl UnsignedTransaction {
    fn fields_length(&self) -> usize {
        self.nonce.length()
            + self.gas_price.length()
            + self.gas_limit.length()
            + to_length(&self.to)
            + self.value.length()
            + self.data.length()
    }

    fn encode_fields(&self, out: &mut dyn BufMut) {
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        encode_to(&self.to, out);
        self.value.encode(out);
        self.data.encode(out);
    }

    /// The EIP-155 signing hash:
    /// `keccak256(rlp([nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0]))`.
    pub fn signing_hash(&self, chain_id: u64) -> B256 {
        let payload_length = self.fields_length() + chain_id.length() + 2;
        let mut buf = Vec::with_capacity(payload_length + 9);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut buf);
        self.encode_fields(&mut buf);
        chain_id.encode(&mut buf);
        0u8.encode(&mut buf);
        0u8.encode(&mut buf);
        keccak256(&buf)
    }
}

/// A transaction with its EIP-155 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    transaction: UnsignedTransaction,
    chain_id: u64,
    signature: RecoverableSignature,
}

impl SignedTransaction {
    /// Attaches `signature`, made over `transaction.signing_hash(chain_id)`.
    pub fn new(
        transaction: UnsignedTransaction,
        chain_id: u64,
        signature: RecoverableSignature,
    ) -> Result<Self, CustodyError> {
        validate_chain_id(chain_id)?;
        Ok(Self {
            transaction,
            chain_id,
            signature,
        })
    }

    /// The signed fields.
    pub fn transaction(&self) -> &UnsignedTransaction {
        &self.transaction
    }

    /// The chain the signature is bound to.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// The signature.
    pub fn signature(&self) -> &RecoverableSignature {
        &self.signature
    }

    /// `recovery_id + 35 + 2 * chain_id`.
    pub fn v(&self) -> u64 {
        u64::from(self.signature.y_parity()) + EIP155_V_OFFSET + 2 * self.chain_id
    }

    fn payload_length(&self) -> usize {
        self.transaction.fields_length()
            + self.v().length()
            + self.signature.r().length()
            + self.signature.s().length()
    }

    /// The canonical wire form,
    /// `rlp([nonce, gasPrice, gasLimit, to, value, data, v, r, s])`.
    pub fn encode(&self) -> Vec<u8> {
        let payload_length = self.payload_length();
        let mut out = Vec::with_capacity(payload_length + 9);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        self.transaction.encode_fields(&mut out);
        self.v().encode(&mut out);
        self.signature.r().encode(&mut out);
        self.signature.s().encode(&mut out);
        out
    }

    /// Decodes the wire form. The input must hold exactly one canonically
    /// encoded EIP-155 transaction.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, CustodyError> {
        let buf = &mut bytes;
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString.into());
        }
        if header.payload_length > buf.len() {
            return Err(alloy_rlp::Error::InputTooShort.into());
        }
        let remaining = buf.len();

        let transaction = UnsignedTransaction {
            nonce: Decodable::decode(buf)?,
            gas_price: Decodable::decode(buf)?,
            gas_limit: Decodable::decode(buf)?,
            to: decode_to(buf)?,
            value: Decodable::decode(buf)?,
            data: Decodable::decode(buf)?,
        };
        let v = u64::decode(buf)?;
        let r = U256::decode(buf)?;
        let s = U256::decode(buf)?;

        let consumed = remaining - buf.len();
        if consumed != header.payload_length {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: header.payload_length,
                got: consumed,
            }
            .into());
        }
        if !buf.is_empty() {
            return Err(alloy_rlp::Error::Custom("trailing bytes after transaction").into());
        }
        if v < EIP155_V_OFFSET {
            return Err(alloy_rlp::Error::Custom("transaction is not EIP-155 protected").into());
        }

        let chain_id = (v - EIP155_V_OFFSET) / 2;
        let y_parity = (v - EIP155_V_OFFSET) % 2 == 1;
        let signature = RecoverableSignature::from_parts(r, s, y_parity)?;
        Self::new(transaction, chain_id, signature)
    }

    /// The transaction hash, `keccak256` of the wire form.
    pub fn hash(&self) -> B256 {
        keccak256(self.encode())
    }

    /// The address that signed the transaction.
    pub fn recover_signer(&self) -> Result<Address, CustodyError> {
        let hash = self.transaction.signing_hash(self.chain_id);
        let key = self.signature.recover(&hash)?;
        Ok(derive_address(&key))
    }
}
