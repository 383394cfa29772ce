//! The boundary between the custody core and a PKCS#11 token.
//!
//! [`Device`] is the operation set the core consumes: slot enumeration, token
//! provisioning, authenticated sessions, attribute-based object search, EC key
//! generation and raw ECDSA signing. [`Pkcs11Device`] drives a real module through
//! `pkcs11::Ctx`; [`MemoryDevice`] is a software token with the same semantics.

use pkcs11::types::{
    CKA_EC_PARAMS, CKA_EC_POINT, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKR_ARGUMENTS_BAD,
    CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID, CKR_CANCEL, CKR_CRYPTOKI_NOT_INITIALIZED,
    CKR_DATA_LEN_RANGE, CKR_DEVICE_ERROR, CKR_DEVICE_MEMORY, CKR_DEVICE_REMOVED,
    CKR_DOMAIN_PARAMS_INVALID, CKR_FUNCTION_FAILED, CKR_GENERAL_ERROR, CKR_HOST_MEMORY,
    CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID, CKR_MECHANISM_INVALID,
    CKR_OBJECT_HANDLE_INVALID, CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED,
    CKR_PIN_EXPIRED, CKR_PIN_INCORRECT, CKR_PIN_INVALID, CKR_PIN_LEN_RANGE, CKR_PIN_LOCKED,
    CKR_SESSION_CLOSED, CKR_SESSION_COUNT, CKR_SESSION_EXISTS, CKR_SESSION_HANDLE_INVALID,
    CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT, CKR_TOKEN_NOT_RECOGNIZED,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_ANOTHER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
    CKR_USER_PIN_NOT_INITIALIZED, CKR_USER_TYPE_INVALID, CKU_SO, CKU_USER, CK_ATTRIBUTE_TYPE,
    CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CK_USER_TYPE,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

mod hardware;
mod memory;

pub use hardware::Pkcs11Device;
pub use memory::{DeviceOperation, MemoryDevice, SignatureQuirk};

/// Numeric identifier of a slot.
pub type SlotId = CK_SLOT_ID;

/// Handle of an open session.
pub type SessionHandle = CK_SESSION_HANDLE;

/// Handle of an object living in a token.
pub type ObjectHandle = CK_OBJECT_HANDLE;

/// The role a session authenticates as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserType {
    /// The security officer, allowed to initialize the user PIN.
    SecurityOfficer,
    /// The normal (crypto) user, allowed to generate keys and sign.
    User,
}

impl From<UserType> for CK_USER_TYPE {
    fn from(user: UserType) -> Self {
        match user {
            UserType::SecurityOfficer => CKU_SO,
            UserType::User => CKU_USER,
        }
    }
}

/// Class of a key object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// `CKO_PUBLIC_KEY`.
    PublicKey,
    /// `CKO_PRIVATE_KEY`.
    PrivateKey,
}

impl ObjectClass {
    pub(crate) fn ck_class(self) -> CK_OBJECT_CLASS {
        match self {
            ObjectClass::PublicKey => CKO_PUBLIC_KEY,
            ObjectClass::PrivateKey => CKO_PRIVATE_KEY,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectClass::PublicKey => f.write_str("public key"),
            ObjectClass::PrivateKey => f.write_str("private key"),
        }
    }
}

/// Attribute template used to search for key objects. The key type is always EC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectTemplate {
    /// The object class to match.
    pub class: ObjectClass,
}

impl ObjectTemplate {
    /// Matches EC key objects of the given class.
    pub fn ec(class: ObjectClass) -> Self {
        Self { class }
    }
}

/// Attributes of a public key object the core reads back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// `CKA_EC_PARAMS`: DER-encoded domain parameters.
    EcParams,
    /// `CKA_EC_POINT`: DER octet string wrapping the SEC1 point.
    EcPoint,
}

impl Attribute {
    pub(crate) fn ck_type(self) -> CK_ATTRIBUTE_TYPE {
        match self {
            Attribute::EcParams => CKA_EC_PARAMS,
            Attribute::EcPoint => CKA_EC_POINT,
        }
    }
}

/// Token information relevant to label resolution and provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// The token label, with the PKCS#11 blank padding removed.
    pub label: String,
    /// Whether the token has been initialized (`CKF_TOKEN_INITIALIZED`).
    pub initialized: bool,
}

/// Usage flags of a generated public key object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyPolicy {
    /// Persist the object on the token.
    pub token: bool,
    /// Allow verification.
    pub verify: bool,
}

/// Usage flags of a generated private key object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateKeyPolicy {
    /// Persist the object on the token.
    pub token: bool,
    /// Allow signing.
    pub sign: bool,
    /// Mark the key sensitive.
    pub sensitive: bool,
    /// Allow the key to be wrapped out of the token.
    pub extractable: bool,
}

/// Templates for `C_GenerateKeyPair` with `CKM_EC_KEY_PAIR_GEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcKeyPairTemplate {
    /// DER-encoded curve OID placed in `CKA_EC_PARAMS`.
    pub ec_params: Vec<u8>,
    /// Flags of the public key object.
    pub public: PublicKeyPolicy,
    /// Flags of the private key object.
    pub private: PrivateKeyPolicy,
}

/// An error reported by the token or by the module loader.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The module returned a `CKR_*` value other than `CKR_OK`.
    #[error("{} (0x{:x})", rv_name(*.0), .0)]
    ReturnValue(CK_RV),

    /// The module could not be loaded or misbehaved outside the `CK_RV` contract.
    #[error("PKCS#11 module error: {0}")]
    Module(String),
}

impl DeviceError {
    /// The raw return value, if the error came from the token.
    pub fn return_value(&self) -> Option<CK_RV> {
        match self {
            DeviceError::ReturnValue(rv) => Some(*rv),
            DeviceError::Module(_) => None,
        }
    }

    /// Whether the token rejected the credential or the role.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.return_value(),
            Some(
                CKR_PIN_INCORRECT
                    | CKR_PIN_INVALID
                    | CKR_PIN_LEN_RANGE
                    | CKR_PIN_EXPIRED
                    | CKR_PIN_LOCKED
                    | CKR_USER_PIN_NOT_INITIALIZED
                    | CKR_USER_TYPE_INVALID
                    | CKR_USER_NOT_LOGGED_IN
            )
        )
    }

    /// Whether a login failed only because the token already holds a login for
    /// this application. PKCS#11 shares login state between the sessions of a token.
    pub(crate) fn is_already_logged_in(&self) -> bool {
        self.return_value() == Some(CKR_USER_ALREADY_LOGGED_IN)
    }
}

impl From<pkcs11::errors::Error> for DeviceError {
    fn from(err: pkcs11::errors::Error) -> Self {
        match err {
            pkcs11::errors::Error::Pkcs11(rv) => DeviceError::ReturnValue(rv),
            other => DeviceError::Module(other.to_string()),
        }
    }
}

fn rv_name(rv: CK_RV) -> &'static str {
    match rv {
        CKR_CANCEL => "CKR_CANCEL",
        CKR_HOST_MEMORY => "CKR_HOST_MEMORY",
        CKR_SLOT_ID_INVALID => "CKR_SLOT_ID_INVALID",
        CKR_GENERAL_ERROR => "CKR_GENERAL_ERROR",
        CKR_FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
        CKR_ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
        CKR_ATTRIBUTE_SENSITIVE => "CKR_ATTRIBUTE_SENSITIVE",
        CKR_ATTRIBUTE_TYPE_INVALID => "CKR_ATTRIBUTE_TYPE_INVALID",
        CKR_DATA_LEN_RANGE => "CKR_DATA_LEN_RANGE",
        CKR_DEVICE_ERROR => "CKR_DEVICE_ERROR",
        CKR_DEVICE_MEMORY => "CKR_DEVICE_MEMORY",
        CKR_DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
        CKR_DOMAIN_PARAMS_INVALID => "CKR_DOMAIN_PARAMS_INVALID",
        CKR_KEY_HANDLE_INVALID => "CKR_KEY_HANDLE_INVALID",
        CKR_KEY_FUNCTION_NOT_PERMITTED => "CKR_KEY_FUNCTION_NOT_PERMITTED",
        CKR_MECHANISM_INVALID => "CKR_MECHANISM_INVALID",
        CKR_OBJECT_HANDLE_INVALID => "CKR_OBJECT_HANDLE_INVALID",
        CKR_OPERATION_ACTIVE => "CKR_OPERATION_ACTIVE",
        CKR_OPERATION_NOT_INITIALIZED => "CKR_OPERATION_NOT_INITIALIZED",
        CKR_PIN_INCORRECT => "CKR_PIN_INCORRECT",
        CKR_PIN_INVALID => "CKR_PIN_INVALID",
        CKR_PIN_LEN_RANGE => "CKR_PIN_LEN_RANGE",
        CKR_PIN_EXPIRED => "CKR_PIN_EXPIRED",
        CKR_PIN_LOCKED => "CKR_PIN_LOCKED",
        CKR_SESSION_CLOSED => "CKR_SESSION_CLOSED",
        CKR_SESSION_COUNT => "CKR_SESSION_COUNT",
        CKR_SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
        CKR_SESSION_EXISTS => "CKR_SESSION_EXISTS",
        CKR_TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
        CKR_TOKEN_NOT_RECOGNIZED => "CKR_TOKEN_NOT_RECOGNIZED",
        CKR_USER_ALREADY_LOGGED_IN => "CKR_USER_ALREADY_LOGGED_IN",
        CKR_USER_ANOTHER_ALREADY_LOGGED_IN => "CKR_USER_ANOTHER_ALREADY_LOGGED_IN",
        CKR_USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
        CKR_USER_PIN_NOT_INITIALIZED => "CKR_USER_PIN_NOT_INITIALIZED",
        CKR_USER_TYPE_INVALID => "CKR_USER_TYPE_INVALID",
        CKR_CRYPTOKI_NOT_INITIALIZED => "CKR_CRYPTOKI_NOT_INITIALIZED",
        _ => "CKR_UNKNOWN",
    }
}

/// The operation set consumed from an HSM.
///
/// Calls are synchronous and may block for as long as the hardware does. A
/// session handle is only ever used by the caller that opened it.
pub trait Device {
    /// Lists slots that currently hold a token.
    fn slots(&self) -> Result<Vec<SlotId>, DeviceError>;

    /// Reads the label and initialization state of the token in `slot`.
    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, DeviceError>;

    /// Initializes the token in `slot`, binding it to `label`.
    fn init_token(&self, slot: SlotId, so_pin: &str, label: &str) -> Result<(), DeviceError>;

    /// Opens a serial read/write session.
    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, DeviceError>;

    /// Closes a session, ending any search or login bound to it.
    fn close_session(&self, session: SessionHandle) -> Result<(), DeviceError>;

    /// Authenticates the session as `user`.
    fn login(&self, session: SessionHandle, user: UserType, pin: &str) -> Result<(), DeviceError>;

    /// Ends the login of the session.
    fn logout(&self, session: SessionHandle) -> Result<(), DeviceError>;

    /// Sets the user PIN. Requires a security officer login.
    fn init_pin(&self, session: SessionHandle, pin: &str) -> Result<(), DeviceError>;

    /// Starts an object search. Only one search may be active per session.
    fn find_objects_init(
        &self,
        session: SessionHandle,
        template: &ObjectTemplate,
    ) -> Result<(), DeviceError>;

    /// Returns up to `max` further matches of the active search.
    fn find_objects(
        &self,
        session: SessionHandle,
        max: usize,
    ) -> Result<Vec<ObjectHandle>, DeviceError>;

    /// Terminates the active search.
    fn find_objects_final(&self, session: SessionHandle) -> Result<(), DeviceError>;

    /// Reads the value of one attribute.
    fn attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: Attribute,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Generates an EC key pair, returning `(public, private)` handles.
    fn generate_ec_key_pair(
        &self,
        session: SessionHandle,
        template: &EcKeyPairTemplate,
    ) -> Result<(ObjectHandle, ObjectHandle), DeviceError>;

    /// Signs `data` with `CKM_ECDSA`, returning the raw `r || s`.
    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError>;
}

impl<D: Device + ?Sized> Device for Arc<D> {
    fn slots(&self) -> Result<Vec<SlotId>, DeviceError> {
        (**self).slots()
    }
    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, DeviceError> {
        (**self).token_info(slot)
    }
    fn init_token(&self, slot: SlotId, so_pin: &str, label: &str) -> Result<(), DeviceError> {
        (**self).init_token(slot, so_pin, label)
    }
    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, DeviceError> {
        (**self).open_session(slot)
    }
    fn close_session(&self, session: SessionHandle) -> Result<(), DeviceError> {
        (**self).close_session(session)
    }
    fn login(&self, session: SessionHandle, user: UserType, pin: &str) -> Result<(), DeviceError> {
        (**self).login(session, user, pin)
    }
    fn logout(&self, session: SessionHandle) -> Result<(), DeviceError> {
        (**self).logout(session)
    }
    fn init_pin(&self, session: SessionHandle, pin: &str) -> Result<(), DeviceError> {
        (**self).init_pin(session, pin)
    }
    fn find_objects_init(
        &self,
        session: SessionHandle,
        template: &ObjectTemplate,
    ) -> Result<(), DeviceError> {
        (**self).find_objects_init(session, template)
    }
    fn find_objects(
        &self,
        session: SessionHandle,
        max: usize,
    ) -> Result<Vec<ObjectHandle>, DeviceError> {
        (**self).find_objects(session, max)
    }
    fn find_objects_final(&self, session: SessionHandle) -> Result<(), DeviceError> {
        (**self).find_objects_final(session)
    }
    fn attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: Attribute,
    ) -> Result<Vec<u8>, DeviceError> {
        (**self).attribute(session, object, attribute)
    }
    fn generate_ec_key_pair(
        &self,
        session: SessionHandle,
        template: &EcKeyPairTemplate,
    ) -> Result<(ObjectHandle, ObjectHandle), DeviceError> {
        (**self).generate_ec_key_pair(session, template)
    }
    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        (**self).sign(session, key, data)
    }
}
