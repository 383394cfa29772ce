use super::{
    Attribute, Device, DeviceError, EcKeyPairTemplate, ObjectClass, ObjectHandle, ObjectTemplate,
    PrivateKeyPolicy, SessionHandle, SlotId, TokenInfo, UserType,
};
use crate::keys::SECP256K1_EC_PARAMS;
use crate::registry::MAX_LABEL_LEN;

use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::PrimeField;
use pkcs11::types::{
    CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_TYPE_INVALID, CKR_DATA_LEN_RANGE, CKR_DOMAIN_PARAMS_INVALID,
    CKR_FUNCTION_FAILED, CKR_GENERAL_ERROR, CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID,
    CKR_OBJECT_HANDLE_INVALID, CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED,
    CKR_PIN_INCORRECT, CKR_SESSION_COUNT, CKR_SESSION_EXISTS, CKR_SESSION_HANDLE_INVALID,
    CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_RECOGNIZED, CKR_USER_ALREADY_LOGGED_IN,
    CKR_USER_ANOTHER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN, CKR_USER_PIN_NOT_INITIALIZED,
    CK_RV,
};
use rand::rngs::OsRng;
use simple_asn1::{to_der, ASN1Block};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A device operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DeviceOperation {
    ListSlots,
    TokenInfo,
    InitToken,
    OpenSession,
    CloseSession,
    Login,
    Logout,
    InitPin,
    FindObjectsInit,
    FindObjects,
    FindObjectsFinal,
    Attribute,
    GenerateKeyPair,
    Sign,
}

/// A deviation applied to the next signature a [`MemoryDevice`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureQuirk {
    /// Return the high-S twin `(r, n - s)` of the signature.
    HighS,
    /// Sign with a fresh key instead of the requested object.
    ForeignKey,
}

enum Object {
    Public {
        key: VerifyingKey,
        ec_params: Vec<u8>,
    },
    Private {
        key: SigningKey,
        policy: PrivateKeyPolicy,
    },
}

impl Object {
    fn class(&self) -> ObjectClass {
        match self {
            Object::Public { .. } => ObjectClass::PublicKey,
            Object::Private { .. } => ObjectClass::PrivateKey,
        }
    }
}

#[derive(Default)]
struct Token {
    label: String,
    initialized: bool,
    so_pin: Option<String>,
    user_pin: Option<String>,
    login: Option<UserType>,
    objects: BTreeMap<ObjectHandle, Object>,
}

struct SessionState {
    slot: SlotId,
    search: Option<VecDeque<ObjectHandle>>,
}

#[derive(Default)]
struct Counters {
    opened: usize,
    close_calls: usize,
    sign_calls: usize,
}

#[derive(Default)]
struct State {
    tokens: BTreeMap<SlotId, Token>,
    sessions: HashMap<SessionHandle, SessionState>,
    next_handle: u64,
    counters: Counters,
    faults: HashMap<DeviceOperation, VecDeque<CK_RV>>,
    quirks: VecDeque<SignatureQuirk>,
}

fn rv(rv: CK_RV) -> DeviceError {
    DeviceError::ReturnValue(rv)
}

impl State {
    fn fault(&mut self, operation: DeviceOperation) -> Result<(), DeviceError> {
        match self.faults.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(code) => Err(rv(code)),
            None => Ok(()),
        }
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn session(&self, session: SessionHandle) -> Result<&SessionState, DeviceError> {
        self.sessions
            .get(&session)
            .ok_or(rv(CKR_SESSION_HANDLE_INVALID))
    }

    fn session_mut(&mut self, session: SessionHandle) -> Result<&mut SessionState, DeviceError> {
        self.sessions
            .get_mut(&session)
            .ok_or(rv(CKR_SESSION_HANDLE_INVALID))
    }

    fn login_of(&self, session: SessionHandle) -> Result<Option<UserType>, DeviceError> {
        let slot = self.session(session)?.slot;
        Ok(self.token(slot)?.login)
    }

    fn user_slot(&self, session: SessionHandle) -> Result<SlotId, DeviceError> {
        match self.login_of(session)? {
            Some(UserType::User) => Ok(self.session(session)?.slot),
            _ => Err(rv(CKR_USER_NOT_LOGGED_IN)),
        }
    }

    fn token(&self, slot: SlotId) -> Result<&Token, DeviceError> {
        self.tokens.get(&slot).ok_or(rv(CKR_SLOT_ID_INVALID))
    }

    fn token_mut(&mut self, slot: SlotId) -> Result<&mut Token, DeviceError> {
        self.tokens.get_mut(&slot).ok_or(rv(CKR_SLOT_ID_INVALID))
    }
}

/// A secp256k1-capable token kept in process memory.
///
/// It follows the PKCS#11 state rules the custody core relies on (one search per
/// session, user login before key use, non-extractable private keys) and counts
/// session and signing calls so callers can check resource pairing. Faults and
/// signature quirks can be queued to exercise failure paths. As on a real
/// token, login state belongs to the token: a login through one session
/// applies to all of its sessions, a logout through any of them ends it, and
/// closing the token's last session logs out.
pub struct MemoryDevice {
    state: Mutex<State>,
    max_sessions: usize,
}

impl MemoryDevice {
    /// Creates a device with `slots` uninitialized tokens, numbered from 0.
    pub fn new(slots: usize) -> Self {
        let mut state = State::default();
        for slot in 0..slots {
            state.tokens.insert(slot as SlotId, Token::default());
        }
        Self {
            state: Mutex::new(state),
            max_sessions: usize::MAX,
        }
    }

    /// Limits the number of concurrently open sessions; further opens fail with
    /// `CKR_SESSION_COUNT`.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Makes the next call of `operation` fail with `code`. Repeated calls queue
    /// further failures.
    pub fn fail_next(&self, operation: DeviceOperation, code: CK_RV) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(code);
    }

    /// Applies `quirk` to the next signature produced.
    pub fn queue_signature_quirk(&self, quirk: SignatureQuirk) {
        self.lock().quirks.push_back(quirk);
    }

    /// Number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of sessions ever opened successfully.
    pub fn sessions_opened(&self) -> usize {
        self.lock().counters.opened
    }

    /// Number of `close_session` calls, including failed ones.
    pub fn close_calls(&self) -> usize {
        self.lock().counters.close_calls
    }

    /// Number of `sign` calls, including failed ones.
    pub fn sign_calls(&self) -> usize {
        self.lock().counters.sign_calls
    }

    /// The role currently logged in on `slot`, if any.
    pub fn logged_in_as(&self, slot: SlotId) -> Option<UserType> {
        self.lock().tokens.get(&slot).and_then(|token| token.login)
    }

    /// Number of sessions with an object search in progress.
    pub fn active_searches(&self) -> usize {
        self.lock()
            .sessions
            .values()
            .filter(|session| session.search.is_some())
            .count()
    }

    /// Number of key objects stored in `slot`.
    pub fn object_count(&self, slot: SlotId) -> usize {
        self.lock()
            .tokens
            .get(&slot)
            .map_or(0, |token| token.objects.len())
    }

    /// The flags the first private key of `slot` was generated with.
    pub fn private_key_policy(&self, slot: SlotId) -> Option<PrivateKeyPolicy> {
        self.lock().tokens.get(&slot).and_then(|token| {
            token.objects.values().find_map(|object| match object {
                Object::Private { policy, .. } => Some(*policy),
                Object::Public { .. } => None,
            })
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryDevice")
            .field("slots", &state.tokens.len())
            .field("open_sessions", &state.sessions.len())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

fn encode_point(key: &VerifyingKey) -> Result<Vec<u8>, DeviceError> {
    let point = key.to_encoded_point(false);
    to_der(&ASN1Block::OctetString(0, point.as_bytes().to_vec())).map_err(|_| rv(CKR_GENERAL_ERROR))
}

fn high_s(signature: &Signature) -> Vec<u8> {
    let (r, _) = signature.split_bytes();
    let s = -*signature.s();
    let mut raw = r.to_vec();
    raw.extend_from_slice(&s.to_repr());
    raw
}

impl Device for MemoryDevice {
    fn slots(&self) -> Result<Vec<SlotId>, DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::ListSlots)?;
        Ok(state.tokens.keys().copied().collect())
    }

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::TokenInfo)?;
        let token = state.token(slot)?;
        Ok(TokenInfo {
            label: token.label.clone(),
            initialized: token.initialized,
        })
    }

    fn init_token(&self, slot: SlotId, so_pin: &str, label: &str) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::InitToken)?;
        if label.len() > MAX_LABEL_LEN {
            return Err(rv(CKR_ARGUMENTS_BAD));
        }
        if state.sessions.values().any(|session| session.slot == slot) {
            return Err(rv(CKR_SESSION_EXISTS));
        }
        let token = state.token_mut(slot)?;
        if token.initialized && token.so_pin.as_deref() != Some(so_pin) {
            return Err(rv(CKR_PIN_INCORRECT));
        }
        *token = Token {
            label: label.to_string(),
            initialized: true,
            so_pin: Some(so_pin.to_string()),
            user_pin: None,
            login: None,
            objects: BTreeMap::new(),
        };
        Ok(())
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::OpenSession)?;
        if !state.token(slot)?.initialized {
            return Err(rv(CKR_TOKEN_NOT_RECOGNIZED));
        }
        if state.sessions.len() >= self.max_sessions {
            return Err(rv(CKR_SESSION_COUNT));
        }
        let handle = state.allocate();
        state.sessions.insert(
            handle,
            SessionState { slot, search: None },
        );
        state.counters.opened += 1;
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.counters.close_calls += 1;
        state.fault(DeviceOperation::CloseSession)?;
        let slot = state
            .sessions
            .remove(&session)
            .ok_or(rv(CKR_SESSION_HANDLE_INVALID))?
            .slot;
        if !state.sessions.values().any(|other| other.slot == slot) {
            state.token_mut(slot)?.login = None;
        }
        Ok(())
    }

    fn login(&self, session: SessionHandle, user: UserType, pin: &str) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::Login)?;
        let slot = state.session(session)?.slot;
        let token = state.token(slot)?;
        match token.login {
            Some(held) if held == user => return Err(rv(CKR_USER_ALREADY_LOGGED_IN)),
            Some(_) => return Err(rv(CKR_USER_ANOTHER_ALREADY_LOGGED_IN)),
            None => {}
        }
        let expected = match user {
            UserType::SecurityOfficer => token.so_pin.as_deref(),
            UserType::User => Some(
                token
                    .user_pin
                    .as_deref()
                    .ok_or(rv(CKR_USER_PIN_NOT_INITIALIZED))?,
            ),
        };
        if expected != Some(pin) {
            return Err(rv(CKR_PIN_INCORRECT));
        }
        state.token_mut(slot)?.login = Some(user);
        Ok(())
    }

    fn logout(&self, session: SessionHandle) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::Logout)?;
        let slot = state.session(session)?.slot;
        if state.token_mut(slot)?.login.take().is_none() {
            return Err(rv(CKR_USER_NOT_LOGGED_IN));
        }
        Ok(())
    }

    fn init_pin(&self, session: SessionHandle, pin: &str) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::InitPin)?;
        if state.login_of(session)? != Some(UserType::SecurityOfficer) {
            return Err(rv(CKR_USER_NOT_LOGGED_IN));
        }
        let slot = state.session(session)?.slot;
        state.token_mut(slot)?.user_pin = Some(pin.to_string());
        Ok(())
    }

    fn find_objects_init(
        &self,
        session: SessionHandle,
        template: &ObjectTemplate,
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::FindObjectsInit)?;
        let current = state.session(session)?;
        if current.search.is_some() {
            return Err(rv(CKR_OPERATION_ACTIVE));
        }
        let token = state.token(current.slot)?;
        let private_visible = token.login == Some(UserType::User);
        let matches = token
            .objects
            .iter()
            .filter(|(_, object)| object.class() == template.class)
            .filter(|(_, object)| private_visible || object.class() == ObjectClass::PublicKey)
            .map(|(handle, _)| *handle)
            .collect();
        state.session_mut(session)?.search = Some(matches);
        Ok(())
    }

    fn find_objects(
        &self,
        session: SessionHandle,
        max: usize,
    ) -> Result<Vec<ObjectHandle>, DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::FindObjects)?;
        let search = state
            .session_mut(session)?
            .search
            .as_mut()
            .ok_or(rv(CKR_OPERATION_NOT_INITIALIZED))?;
        let count = max.min(search.len());
        Ok(search.drain(..count).collect())
    }

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::FindObjectsFinal)?;
        state
            .session_mut(session)?
            .search
            .take()
            .map(|_| ())
            .ok_or(rv(CKR_OPERATION_NOT_INITIALIZED))
    }

    fn attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: Attribute,
    ) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::Attribute)?;
        let slot = state.session(session)?.slot;
        match (state.token(slot)?.objects.get(&object), attribute) {
            (None, _) => Err(rv(CKR_OBJECT_HANDLE_INVALID)),
            (Some(Object::Public { ec_params, .. }), Attribute::EcParams) => Ok(ec_params.clone()),
            (Some(Object::Public { key, .. }), Attribute::EcPoint) => encode_point(key),
            (Some(Object::Private { .. }), Attribute::EcParams) => Ok(SECP256K1_EC_PARAMS.to_vec()),
            (Some(Object::Private { .. }), Attribute::EcPoint) => Err(rv(CKR_ATTRIBUTE_TYPE_INVALID)),
        }
    }

    fn generate_ec_key_pair(
        &self,
        session: SessionHandle,
        template: &EcKeyPairTemplate,
    ) -> Result<(ObjectHandle, ObjectHandle), DeviceError> {
        let mut state = self.lock();
        state.fault(DeviceOperation::GenerateKeyPair)?;
        let slot = state.user_slot(session)?;
        if template.ec_params != SECP256K1_EC_PARAMS {
            return Err(rv(CKR_DOMAIN_PARAMS_INVALID));
        }

        let private_key = SigningKey::random(&mut OsRng);
        let public_key = VerifyingKey::from(&private_key);
        let public_handle = state.allocate();
        let private_handle = state.allocate();
        let objects = &mut state.token_mut(slot)?.objects;
        objects.insert(
            public_handle,
            Object::Public {
                key: public_key,
                ec_params: template.ec_params.clone(),
            },
        );
        objects.insert(
            private_handle,
            Object::Private {
                key: private_key,
                policy: template.private,
            },
        );
        Ok((public_handle, private_handle))
    }

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.lock();
        state.counters.sign_calls += 1;
        state.fault(DeviceOperation::Sign)?;
        let slot = state.user_slot(session)?;
        let signing_key = match state.token(slot)?.objects.get(&key) {
            Some(Object::Private { key, policy }) if policy.sign => key.clone(),
            Some(_) => return Err(rv(CKR_KEY_FUNCTION_NOT_PERMITTED)),
            None => return Err(rv(CKR_KEY_HANDLE_INVALID)),
        };
        if data.len() != 32 {
            return Err(rv(CKR_DATA_LEN_RANGE));
        }
        let quirk = state.quirks.pop_front();
        drop(state);

        let signing_key = match quirk {
            Some(SignatureQuirk::ForeignKey) => SigningKey::random(&mut OsRng),
            _ => signing_key,
        };
        let signature: Signature = signing_key
            .sign_prehash(data)
            .map_err(|_| rv(CKR_FUNCTION_FAILED))?;
        match quirk {
            Some(SignatureQuirk::HighS) => Ok(high_s(&signature)),
            _ => Ok(signature.to_bytes().to_vec()),
        }
    }
}
