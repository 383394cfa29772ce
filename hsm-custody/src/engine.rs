//! The top-level custody operations.

use crate::address::{derive_address, LabeledAddress};
use crate::config::{Credentials, EngineConfig, HsmConfig, LowSStrategy};
use crate::device::{Device, ObjectHandle, Pkcs11Device, SlotId, UserType};
use crate::error::{CustodyError, Step};
use crate::keys::{self, EcPublicKey};
use crate::locator::{find_private_key, find_public_key};
use crate::policy::{AllowAll, Policy, PolicyRequest};
use crate::registry::{SlotLabel, SlotRegistry};
use crate::session::{LoginTable, Session};
use crate::signature::{is_low_s, normalize_s, parse_raw_signature, RecoverableSignature};
use crate::transaction::{validate_chain_id, SignedTransaction, UnsignedTransaction};
use alloy_primitives::{Bytes, B256};
use k256::ecdsa::Signature;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// The point in time an operation must finish by.
#[derive(Debug, Clone, Copy)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(timeout: Option<Duration>) -> Self {
        Deadline(timeout.and_then(|timeout| Instant::now().checked_add(timeout)))
    }

    fn check(&self, step: Step) -> Result<(), CustodyError> {
        match self.0 {
            Some(deadline) if Instant::now() >= deadline => Err(CustodyError::Timeout { step }),
            _ => Ok(()),
        }
    }
}

/// Creates addresses and signs transactions with keys that never leave the
/// device.
///
/// Each operation runs in its own session, which is torn down before the
/// operation returns, whatever its outcome. Operations may run concurrently
/// from several threads, on the same slot or on different ones; concurrent
/// sessions on a slot share its login. The device's session limit is not
/// enforced here.
pub struct SigningEngine<D> {
    device: D,
    credentials: Credentials,
    config: EngineConfig,
    registry: SlotRegistry,
    logins: LoginTable,
    policy: Box<dyn Policy>,
}

impl SigningEngine<Pkcs11Device> {
    /// Loads the PKCS#11 module named by `config` and scans its tokens.
    pub fn connect(config: HsmConfig) -> Result<Self, CustodyError> {
        let device = Pkcs11Device::new(&config.library_path).map_err(CustodyError::DeviceInit)?;
        info!(library = %config.library_path.display(), "PKCS#11 module loaded");
        Self::new(device, config.credentials, config.engine)
    }
}

impl<D: Device> SigningEngine<D> {
    /// Creates an engine over `device` and scans its tokens.
    pub fn new(
        device: D,
        credentials: Credentials,
        config: EngineConfig,
    ) -> Result<Self, CustodyError> {
        let registry = SlotRegistry::new();
        registry.refresh(&device)?;
        Ok(SigningEngine {
            device,
            credentials,
            config,
            registry,
            logins: LoginTable::new(),
            policy: Box::new(AllowAll),
        })
    }

    /// Replaces the policy consulted before creating addresses and signing.
    pub fn with_policy(mut self, policy: impl Policy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Lists every initialized token with its label.
    pub fn labels(&self) -> Result<Vec<SlotLabel>, CustodyError> {
        self.registry.labels(&self.device)
    }

    /// Provisions a new slot under `label`, generates its key pair and returns
    /// the resulting address.
    pub fn create_address(&self, label: &str) -> Result<LabeledAddress, CustodyError> {
        let _span = info_span!("create_address", label).entered();
        let deadline = Deadline::after(self.config.operation_timeout);
        self.policy.check(&PolicyRequest::CreateAddress { label })?;

        deadline.check(Step::InitToken)?;
        let slot = self
            .registry
            .create_slot(&self.device, &self.logins, &self.credentials, label)?;
        let key = self.with_session(slot, &deadline, |session| {
            deadline.check(Step::GenerateKeyPair)?;
            keys::generate_key_pair(session)?;
            let public = find_public_key(session)?;
            keys::read_public_key(session, public)
        })?;

        let address = derive_address(&key);
        info!(slot, %address, "address created");
        Ok(LabeledAddress::new(address, label))
    }

    /// The address of the key held under `label`.
    pub fn get_address_by_label(&self, label: &str) -> Result<LabeledAddress, CustodyError> {
        let _span = info_span!("get_address", label).entered();
        let deadline = Deadline::after(self.config.operation_timeout);
        let slot = self.registry.resolve(&self.device, label)?;
        let key = self.with_session(slot, &deadline, read_slot_key)?;
        Ok(LabeledAddress::new(derive_address(&key), label))
    }

    /// The address of the key held in `slot`, without label resolution.
    pub fn get_address_by_slot(&self, slot: SlotId) -> Result<LabeledAddress, CustodyError> {
        let _span = info_span!("get_slot_address", slot).entered();
        let deadline = Deadline::after(self.config.operation_timeout);
        let key = self.with_session(slot, &deadline, read_slot_key)?;
        Ok(LabeledAddress::unlabeled(derive_address(&key)))
    }

    /// Signs `transaction` for `chain_id` with the key held under `label`.
    ///
    /// The signature is low-S and carries the recovery id that reproduces the
    /// slot's public key; a signature that recovers to any other key is never
    /// returned.
    pub fn sign_transaction(
        &self,
        transaction: &UnsignedTransaction,
        chain_id: u64,
        label: &str,
    ) -> Result<SignedTransaction, CustodyError> {
        let _span = info_span!("sign_transaction", label, chain_id).entered();
        let deadline = Deadline::after(self.config.operation_timeout);
        validate_chain_id(chain_id)?;
        self.policy.check(&PolicyRequest::SignTransaction {
            label,
            chain_id,
            transaction,
        })?;

        let hash = transaction.signing_hash(chain_id);
        let slot = self.registry.resolve(&self.device, label)?;
        let signature = self.with_session(slot, &deadline, |session| {
            let public = find_public_key(session)?;
            let private = find_private_key(session)?;
            let key = keys::read_public_key(session, public)?;
            debug!(slot, "keys located");

            let signature = self.sign_low_s(session, private, &hash, &deadline)?;
            debug!(slot, "signed");

            deadline.check(Step::Recover)?;
            let recoverable = RecoverableSignature::attach(&hash, signature, &key)
                .ok_or(CustodyError::SignatureRecoveryFailed { slot })?;
            debug!(slot, y_parity = recoverable.y_parity(), "signature verified");
            Ok(recoverable)
        })?;

        let signed = SignedTransaction::new(transaction.clone(), chain_id, signature)?;
        info!(slot, hash = %signed.hash(), "transaction signed");
        Ok(signed)
    }

    /// Signs and returns the canonical wire encoding.
    pub fn sign_transaction_encoded(
        &self,
        transaction: &UnsignedTransaction,
        chain_id: u64,
        label: &str,
    ) -> Result<Bytes, CustodyError> {
        self.sign_transaction(transaction, chain_id, label)
            .map(|signed| signed.encode().into())
    }

    fn sign_low_s(
        &self,
        session: &Session<'_, D>,
        private: ObjectHandle,
        hash: &B256,
        deadline: &Deadline,
    ) -> Result<Signature, CustodyError> {
        let sign = || {
            deadline.check(Step::Sign)?;
            parse_raw_signature(&keys::sign_digest(session, private, &hash.0)?)
        };
        match self.config.low_s {
            LowSStrategy::Normalize => {
                let signature = sign()?;
                if !is_low_s(&signature) {
                    debug!(slot = session.slot(), "normalizing high-S signature");
                }
                Ok(normalize_s(signature))
            }
            LowSStrategy::Resign { max_attempts } => {
                for attempt in 1..=max_attempts {
                    let signature = sign()?;
                    if is_low_s(&signature) {
                        return Ok(signature);
                    }
                    debug!(slot = session.slot(), attempt, "high-S signature, signing again");
                }
                Err(CustodyError::SignatureRetriesExhausted {
                    attempts: max_attempts,
                })
            }
        }
    }

    /// Runs `operation` in a user session on `slot`, tearing the session down
    /// afterwards. A failed teardown is logged and does not replace the
    /// operation's outcome.
    fn with_session<T>(
        &self,
        slot: SlotId,
        deadline: &Deadline,
        operation: impl FnOnce(&Session<'_, D>) -> Result<T, CustodyError>,
    ) -> Result<T, CustodyError> {
        let pin = self.credentials.operator_pin();
        let session = Session::open(&self.device, &self.logins, slot, UserType::User, &pin)?;
        let result = deadline
            .check(Step::OpenSession)
            .and_then(|()| operation(&session));
        if let Err(err) = session.close() {
            warn!(slot, error = %err, "session teardown incomplete");
        }
        result
    }
}

fn read_slot_key<D: Device + ?Sized>(
    session: &Session<'_, D>,
) -> Result<EcPublicKey, CustodyError> {
    let public = find_public_key(session)?;
    keys::read_public_key(session, public)
}

impl<D: fmt::Debug> fmt::Debug for SigningEngine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningEngine")
            .field("device", &self.device)
            .field("credentials", &self.credentials)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("logins", &self.logins)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines() {
        assert!(Deadline::after(None).check(Step::Sign).is_ok());
        assert!(Deadline::after(Some(Duration::from_secs(3600)))
            .check(Step::Sign)
            .is_ok());
        assert!(matches!(
            Deadline::after(Some(Duration::ZERO)).check(Step::Sign),
            Err(CustodyError::Timeout { step: Step::Sign })
        ));
    }
}
