//! Custodial key management over a PKCS#11 hardware security module.
//!
//! Keys live in the HSM and never leave it. Each key pair occupies its own
//! token, found by the label it was provisioned with. The crate turns those
//! keys into EVM addresses and EIP-155 transaction signatures: it computes the
//! signing hash, asks the token for a raw `(r, s)`, makes it low-S and finds
//! the recovery id that reproduces the slot's public key.
//!
//! # Example
//!
//! ```rust,no_run
//! use alloy_primitives::{address, U256};
//! use hsm_custody::{Credentials, HsmConfig, SigningEngine, UnsignedTransaction};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials::new("crypto-user", "hunter2", "so-secret");
//! let config = HsmConfig::new("/usr/lib/softhsm/libsofthsm2.so", credentials);
//! let engine = SigningEngine::connect(config)?;
//!
//! let created = engine.create_address("treasury-1")?;
//! let transaction = UnsignedTransaction {
//!     nonce: 1,
//!     gas_price: U256::from(100),
//!     gas_limit: 100,
//!     to: Some(address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")),
//!     value: U256::from(1000),
//!     ..Default::default()
//! };
//! let signed = engine.sign_transaction(&transaction, 3, "treasury-1")?;
//! assert_eq!(signed.recover_signer()?, created.address);
//! # Ok(())
//! # }
//! ```
//!
//! [`MemoryDevice`](device::MemoryDevice) implements the same
//! [`Device`](device::Device) interface in process memory, for tests and local
//! development.

#![warn(
    missing_docs,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]
#![deny(missing_debug_implementations)]

pub mod address;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod keys;
pub mod locator;
pub mod policy;
pub mod registry;
pub mod session;
pub mod signature;
pub mod transaction;

pub use address::{derive_address, LabeledAddress};
pub use config::{Credentials, EngineConfig, HsmConfig, LowSStrategy};
pub use engine::SigningEngine;
pub use error::{CustodyError, ErrorKind, Step, TeardownError};
pub use keys::EcPublicKey;
pub use policy::{AllowAll, Policy, PolicyDenial, PolicyRequest};
pub use registry::{SlotLabel, SlotRegistry};
pub use signature::RecoverableSignature;
pub use transaction::{SignedTransaction, UnsignedTransaction};
