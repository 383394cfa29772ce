//! Error types.

use crate::device::{DeviceError, ObjectClass, SlotId};
use crate::policy::PolicyDenial;
use std::fmt;
use thiserror::Error;

/// A step of an operation against the device, used to give errors context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Enumerating slots.
    ListSlots,
    /// Reading token information.
    TokenInfo,
    /// Initializing a token.
    InitToken,
    /// Setting the user PIN.
    InitPin,
    /// Opening a session.
    OpenSession,
    /// Logging in.
    Login,
    /// Searching for key objects.
    FindObjects,
    /// Reading key attributes.
    ReadAttribute,
    /// Generating a key pair.
    GenerateKeyPair,
    /// Signing a digest.
    Sign,
    /// Reconstructing the recovery id of a signature.
    Recover,
    /// Cancelling an object search.
    CancelSearch,
    /// Logging out.
    Logout,
    /// Closing a session.
    CloseSession,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::ListSlots => "list slots",
            Step::TokenInfo => "read token info",
            Step::InitToken => "initialize token",
            Step::InitPin => "initialize user PIN",
            Step::OpenSession => "open session",
            Step::Login => "login",
            Step::FindObjects => "find objects",
            Step::ReadAttribute => "read attribute",
            Step::GenerateKeyPair => "generate key pair",
            Step::Sign => "sign",
            Step::Recover => "recover signer",
            Step::CancelSearch => "cancel search",
            Step::Logout => "logout",
            Step::CloseSession => "close session",
        })
    }
}

fn on_slot(slot: &Option<SlotId>) -> String {
    slot.map(|slot| format!(" on slot {slot}"))
        .unwrap_or_default()
}

/// An error that occurred while operating custodial keys.
///
/// Messages never contain PINs, key material or raw attribute bytes.
#[derive(Error, Debug)]
pub enum CustodyError {
    /// The PKCS#11 module could not be loaded or initialized.
    #[error("failed to initialize the HSM: {0}")]
    DeviceInit(#[source] DeviceError),

    /// The token rejected the credential or the role.
    #[error("authentication failed on slot {slot} during {step}: {source}")]
    Auth {
        /// The slot the session was bound to.
        slot: SlotId,
        /// The step that was rejected.
        step: Step,
        /// The device error.
        #[source]
        source: DeviceError,
    },

    /// The device failed a step, or is unavailable.
    #[error("{step} failed{}: {source}", on_slot(.slot))]
    Device {
        /// The step that failed.
        step: Step,
        /// The slot involved, if any.
        slot: Option<SlotId>,
        /// The device error.
        #[source]
        source: DeviceError,
    },

    /// The label cannot name a token.
    #[error("invalid label {label:?}: {reason}")]
    InvalidLabel {
        /// The rejected label.
        label: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// No token carries the label.
    #[error("no slot is labelled {label:?}")]
    SlotNotFound {
        /// The requested label.
        label: String,
    },

    /// A token already carries the label.
    #[error("label {label:?} is already bound to a slot")]
    DuplicateLabel {
        /// The requested label.
        label: String,
    },

    /// Several tokens carry the same label. The device needs manual attention.
    #[error("label {label:?} is carried by several slots: {slots:?}")]
    DuplicateSlotLabel {
        /// The ambiguous label.
        label: String,
        /// Every slot carrying it.
        slots: Vec<SlotId>,
    },

    /// Every token present is already initialized.
    #[error("no uninitialized token is available for provisioning")]
    NoFreeSlot,

    /// The token was initialized but its user PIN could not be set. The slot
    /// is unusable until repaired on the device.
    #[error("slot {slot} labelled {label:?} is partially provisioned: {source}")]
    ProvisioningIncomplete {
        /// The initialized slot.
        slot: SlotId,
        /// Its label.
        label: String,
        /// What failed after initialization.
        #[source]
        source: Box<CustodyError>,
    },

    /// The slot holds no matching EC key object.
    #[error("no {class} found on slot {slot}")]
    KeyNotFound {
        /// The searched slot.
        slot: SlotId,
        /// The searched object class.
        class: ObjectClass,
    },

    /// The key's domain parameters do not name secp256k1.
    #[error("key is not on the secp256k1 curve")]
    UnsupportedCurve,

    /// The key's point could not be decoded.
    #[error("malformed public key: {0}")]
    MalformedKey(&'static str),

    /// The device returned, or a decoder met, an unusable signature.
    #[error("malformed signature: {0}")]
    MalformedSignature(&'static str),

    /// Re-signing never produced a low-S signature.
    #[error("no low-S signature after {attempts} signing attempts")]
    SignatureRetriesExhausted {
        /// Number of device signatures requested.
        attempts: u32,
    },

    /// Neither recovery id reproduces the slot's public key.
    #[error("signature from slot {slot} does not recover to its public key")]
    SignatureRecoveryFailed {
        /// The signing slot.
        slot: SlotId,
    },

    /// The chain id cannot be encoded in an EIP-155 `v`.
    #[error("invalid chain id {0}")]
    InvalidChainId(u64),

    /// The policy hook refused the operation.
    #[error("denied by policy: {0}")]
    PolicyDenied(#[from] PolicyDenial),

    /// The operation deadline passed.
    #[error("operation timed out before {step}")]
    Timeout {
        /// The step that was about to run.
        step: Step,
    },

    /// A signed transaction could not be decoded.
    #[error("invalid transaction encoding: {0}")]
    Decode(#[from] alloy_rlp::Error),
}

impl CustodyError {
    /// Wraps a device error with its step and slot, classifying credential
    /// rejections as [`CustodyError::Auth`].
    pub(crate) fn device(step: Step, slot: Option<SlotId>, source: DeviceError) -> Self {
        match slot {
            Some(slot) if source.is_auth_failure() => CustodyError::Auth { slot, step, source },
            _ => CustodyError::Device { step, slot, source },
        }
    }

    /// The stable category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CustodyError::DeviceInit(_) => ErrorKind::DeviceInit,
            CustodyError::Auth { .. } => ErrorKind::Auth,
            CustodyError::Device { .. } => ErrorKind::DeviceUnavailable,
            CustodyError::InvalidLabel { .. } => ErrorKind::InvalidLabel,
            CustodyError::SlotNotFound { .. } => ErrorKind::SlotNotFound,
            CustodyError::DuplicateLabel { .. } => ErrorKind::DuplicateLabel,
            CustodyError::DuplicateSlotLabel { .. } => ErrorKind::DuplicateSlotLabel,
            CustodyError::NoFreeSlot => ErrorKind::NoFreeSlot,
            CustodyError::ProvisioningIncomplete { .. } => ErrorKind::ProvisioningIncomplete,
            CustodyError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            CustodyError::UnsupportedCurve => ErrorKind::UnsupportedCurve,
            CustodyError::MalformedKey(_) => ErrorKind::MalformedKey,
            CustodyError::MalformedSignature(_) => ErrorKind::MalformedSignature,
            CustodyError::SignatureRetriesExhausted { .. } => ErrorKind::SignatureRetriesExhausted,
            CustodyError::SignatureRecoveryFailed { .. } => ErrorKind::SignatureRecoveryFailed,
            CustodyError::InvalidChainId(_) => ErrorKind::InvalidChainId,
            CustodyError::PolicyDenied(_) => ErrorKind::PolicyDenied,
            CustodyError::Timeout { .. } => ErrorKind::Timeout,
            CustodyError::Decode(_) => ErrorKind::Decode,
        }
    }
}

/// Machine-readable category of a [`CustodyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    DeviceInit,
    Auth,
    DeviceUnavailable,
    InvalidLabel,
    SlotNotFound,
    DuplicateLabel,
    DuplicateSlotLabel,
    NoFreeSlot,
    ProvisioningIncomplete,
    KeyNotFound,
    UnsupportedCurve,
    MalformedKey,
    MalformedSignature,
    SignatureRetriesExhausted,
    SignatureRecoveryFailed,
    InvalidChainId,
    PolicyDenied,
    Timeout,
    Decode,
}

impl ErrorKind {
    /// A stable snake_case code, suitable for API responses.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::DeviceInit => "device_init_failure",
            ErrorKind::Auth => "auth_failure",
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::InvalidLabel => "invalid_label",
            ErrorKind::SlotNotFound => "slot_not_found",
            ErrorKind::DuplicateLabel => "duplicate_label",
            ErrorKind::DuplicateSlotLabel => "duplicate_slot_label",
            ErrorKind::NoFreeSlot => "no_free_slot",
            ErrorKind::ProvisioningIncomplete => "provisioning_incomplete",
            ErrorKind::KeyNotFound => "key_not_found",
            ErrorKind::UnsupportedCurve => "unsupported_curve",
            ErrorKind::MalformedKey => "malformed_key",
            ErrorKind::MalformedSignature => "malformed_signature",
            ErrorKind::SignatureRetriesExhausted => "signature_retries_exhausted",
            ErrorKind::SignatureRecoveryFailed => "signature_recovery_failed",
            ErrorKind::InvalidChainId => "invalid_chain_id",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Decode => "decode_failure",
        }
    }

    /// Whether the caller, rather than the device, is at fault.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidLabel
                | ErrorKind::SlotNotFound
                | ErrorKind::DuplicateLabel
                | ErrorKind::KeyNotFound
                | ErrorKind::InvalidChainId
                | ErrorKind::PolicyDenied
                | ErrorKind::Decode
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One teardown step that failed.
#[derive(Debug)]
pub struct TeardownFailure {
    /// The step.
    pub step: Step,
    /// The device error.
    pub source: DeviceError,
}

/// Every teardown step that failed while releasing a session. Each step is
/// attempted regardless of the others.
#[derive(Debug)]
pub struct TeardownError {
    /// The slot of the session.
    pub slot: SlotId,
    /// The failed steps, in the order they were attempted.
    pub failures: Vec<TeardownFailure>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session teardown on slot {} failed:", self.slot)?;
        for (i, failure) in self.failures.iter().enumerate() {
            let separator = if i == 0 { " " } else { "; " };
            write!(f, "{separator}{}: {}", failure.step, failure.source)?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}
