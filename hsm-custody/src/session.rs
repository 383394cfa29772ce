//! Authenticated sessions with guaranteed teardown.

use crate::device::{
    Device, DeviceError, ObjectHandle, ObjectTemplate, SessionHandle, SlotId, UserType,
};
use crate::error::{CustodyError, Step, TeardownError, TeardownFailure};
use pkcs11::types::CKR_USER_ANOTHER_ALREADY_LOGGED_IN;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct Login {
    user: UserType,
    sessions: usize,
}

/// The logins held on each slot by sessions opened through this table.
///
/// PKCS#11 login state belongs to the token and is shared by all of the
/// application's sessions on it, so a logout through one session logs out
/// the others. Sessions sharing a table log in when the first of them opens on
/// a slot and log out when the last one closes.
#[derive(Debug, Default)]
pub struct LoginTable {
    slots: Mutex<HashMap<SlotId, Login>>,
}

impl LoginTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions holding the login on `slot`.
    pub fn holders(&self, slot: SlotId) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .map_or(0, |login| login.sessions)
    }

    // Held across the device call: the count and the token's login state
    // change together.
    fn acquire<D: Device + ?Sized>(
        &self,
        device: &D,
        session: SessionHandle,
        slot: SlotId,
        user: UserType,
        pin: &str,
    ) -> Result<(), DeviceError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(login) = slots.get_mut(&slot) {
            if login.user != user {
                return Err(DeviceError::ReturnValue(CKR_USER_ANOTHER_ALREADY_LOGGED_IN));
            }
            login.sessions += 1;
            return Ok(());
        }
        match device.login(session, user, pin) {
            Ok(()) => {}
            // Left behind by a logout that failed; adopt it.
            Err(err) if err.is_already_logged_in() => {
                debug!(slot, "token already holds a login");
            }
            Err(err) => return Err(err),
        }
        slots.insert(slot, Login { user, sessions: 1 });
        Ok(())
    }

    fn release<D: Device + ?Sized>(
        &self,
        device: &D,
        session: SessionHandle,
        slot: SlotId,
    ) -> Result<(), DeviceError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = match slots.get_mut(&slot) {
            Some(login) => {
                login.sessions -= 1;
                login.sessions
            }
            None => return Ok(()),
        };
        if remaining > 0 {
            return Ok(());
        }
        slots.remove(&slot);
        device.logout(session)
    }
}

/// A logged-in session on one slot.
///
/// Teardown cancels any outstanding object search, releases the login (logging
/// out if no other session of the [`LoginTable`] holds it) and closes the
/// session. Each step is attempted even if an earlier one failed. It runs once,
/// either through [`Session::close`] or when the session is dropped.
pub struct Session<'a, D: Device + ?Sized> {
    device: &'a D,
    logins: &'a LoginTable,
    slot: SlotId,
    handle: SessionHandle,
    logged_in: bool,
    search_active: Cell<bool>,
    released: bool,
}

impl<'a, D: Device + ?Sized> Session<'a, D> {
    /// Opens a session on `slot` and logs in as `user`, or joins the login
    /// another session of `logins` already holds there. A slot held by the
    /// other role is refused with `CKR_USER_ANOTHER_ALREADY_LOGGED_IN`.
    pub fn open(
        device: &'a D,
        logins: &'a LoginTable,
        slot: SlotId,
        user: UserType,
        pin: &str,
    ) -> Result<Self, CustodyError> {
        let handle = device
            .open_session(slot)
            .map_err(|source| CustodyError::device(Step::OpenSession, Some(slot), source))?;
        let mut session = Session {
            device,
            logins,
            slot,
            handle,
            logged_in: false,
            search_active: Cell::new(false),
            released: false,
        };

        if let Err(source) = logins.acquire(device, handle, slot, user, pin) {
            let err = CustodyError::device(Step::Login, Some(slot), source);
            if let Err(teardown) = session.teardown() {
                warn!(slot, error = %teardown, "teardown after failed login");
            }
            return Err(err);
        }
        session.logged_in = true;
        debug!(slot, session = handle, ?user, "session open");
        Ok(session)
    }

    /// The slot the session is bound to.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// The raw session handle.
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// The device the session lives on.
    pub fn device(&self) -> &'a D {
        self.device
    }

    /// Wraps a device error with this session's slot.
    pub(crate) fn error(&self, step: Step, source: DeviceError) -> CustodyError {
        CustodyError::device(step, Some(self.slot), source)
    }

    /// Starts an object search. The search is cancelled when the returned
    /// cursor is dropped.
    pub fn find_objects(
        &self,
        template: &ObjectTemplate,
    ) -> Result<SearchCursor<'_, 'a, D>, CustodyError> {
        if self.search_active.get() {
            self.cancel_search()
                .map_err(|source| self.error(Step::CancelSearch, source))?;
        }
        self.device
            .find_objects_init(self.handle, template)
            .map_err(|source| self.error(Step::FindObjects, source))?;
        self.search_active.set(true);
        Ok(SearchCursor { session: self })
    }

    fn cancel_search(&self) -> Result<(), DeviceError> {
        self.device.find_objects_final(self.handle)?;
        self.search_active.set(false);
        Ok(())
    }

    /// Tears the session down, reporting every step that failed.
    pub fn close(mut self) -> Result<(), TeardownError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), TeardownError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut failures = Vec::new();
        if self.search_active.get() {
            if let Err(source) = self.cancel_search() {
                failures.push(TeardownFailure {
                    step: Step::CancelSearch,
                    source,
                });
            }
        }
        if self.logged_in {
            self.logged_in = false;
            if let Err(source) = self.logins.release(self.device, self.handle, self.slot) {
                failures.push(TeardownFailure {
                    step: Step::Logout,
                    source,
                });
            }
        }
        if let Err(source) = self.device.close_session(self.handle) {
            failures.push(TeardownFailure {
                step: Step::CloseSession,
                source,
            });
        }

        if failures.is_empty() {
            debug!(slot = self.slot, session = self.handle, "session closed");
            Ok(())
        } else {
            Err(TeardownError {
                slot: self.slot,
                failures,
            })
        }
    }
}

impl<D: Device + ?Sized> Drop for Session<'_, D> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(slot = self.slot, error = %err, "session teardown incomplete");
        }
    }
}

impl<D: Device + ?Sized> fmt::Debug for Session<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.slot)
            .field("handle", &self.handle)
            .field("logged_in", &self.logged_in)
            .field("search_active", &self.search_active.get())
            .finish()
    }
}

/// An active object search. Dropping it cancels the search; if cancelling
/// fails, the session retries during teardown.
pub struct SearchCursor<'s, 'a, D: Device + ?Sized> {
    session: &'s Session<'a, D>,
}

impl<D: Device + ?Sized> SearchCursor<'_, '_, D> {
    /// Returns up to `max` further matches.
    pub fn next_batch(&self, max: usize) -> Result<Vec<ObjectHandle>, CustodyError> {
        self.session
            .device
            .find_objects(self.session.handle, max)
            .map_err(|source| self.session.error(Step::FindObjects, source))
    }
}

impl<D: Device + ?Sized> Drop for SearchCursor<'_, '_, D> {
    fn drop(&mut self) {
        if let Err(err) = self.session.cancel_search() {
            warn!(slot = self.session.slot, error = %err, "failed to cancel object search");
        }
    }
}

impl<D: Device + ?Sized> fmt::Debug for SearchCursor<'_, '_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchCursor")
            .field("slot", &self.session.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceOperation, MemoryDevice, ObjectClass};
    use crate::keys::generate_key_pair;
    use pkcs11::types::{CKR_DEVICE_ERROR, CKR_FUNCTION_FAILED, CKR_PIN_INCORRECT};

    const SO_PIN: &str = "so-pin";
    const USER_PIN: &str = "cu:pw";

    fn device() -> MemoryDevice {
        let device = MemoryDevice::new(1);
        device.init_token(0, SO_PIN, "vault").unwrap();
        let logins = LoginTable::new();
        let session =
            Session::open(&device, &logins, 0, UserType::SecurityOfficer, SO_PIN).unwrap();
        device.init_pin(session.handle(), USER_PIN).unwrap();
        session.close().unwrap();
        device
    }

    #[test]
    fn close_releases_everything() {
        let device = device();
        let logins = LoginTable::new();
        let session = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        assert_eq!(device.open_sessions(), 1);
        session.close().unwrap();
        assert_eq!(device.open_sessions(), 0);
        assert_eq!(device.close_calls(), device.sessions_opened());
    }

    #[test]
    fn rejected_pin_closes_the_session() {
        let device = device();
        let logins = LoginTable::new();
        let err = Session::open(&device, &logins, 0, UserType::User, "cu:wrong").unwrap_err();
        assert!(matches!(
            err,
            CustodyError::Auth { slot: 0, step: Step::Login, ref source }
                if source.return_value() == Some(CKR_PIN_INCORRECT)
        ));
        assert_eq!(device.open_sessions(), 0);
    }

    #[test]
    fn teardown_attempts_every_step() {
        let device = device();
        let logins = LoginTable::new();
        let session = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        device.fail_next(DeviceOperation::Logout, CKR_DEVICE_ERROR);
        device.fail_next(DeviceOperation::CloseSession, CKR_FUNCTION_FAILED);
        let err = session.close().unwrap_err();
        let steps: Vec<Step> = err.failures.iter().map(|failure| failure.step).collect();
        assert_eq!(steps, vec![Step::Logout, Step::CloseSession]);
        // Teardown runs once; the drop that follows does not close again.
        assert_eq!(device.close_calls(), 2);
    }

    #[test]
    fn dropping_a_cursor_cancels_the_search() {
        let device = device();
        let logins = LoginTable::new();
        let session = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        {
            let cursor = session
                .find_objects(&ObjectTemplate::ec(ObjectClass::PublicKey))
                .unwrap();
            assert!(cursor.next_batch(1).unwrap().is_empty());
            assert_eq!(device.active_searches(), 1);
        }
        assert_eq!(device.active_searches(), 0);
        drop(session);
        assert_eq!(device.open_sessions(), 0);
    }

    #[test]
    fn failed_cancel_is_retried_at_teardown() {
        let device = device();
        let logins = LoginTable::new();
        let session = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        device.fail_next(DeviceOperation::FindObjectsFinal, CKR_DEVICE_ERROR);
        drop(
            session
                .find_objects(&ObjectTemplate::ec(ObjectClass::PrivateKey))
                .unwrap(),
        );
        assert_eq!(device.active_searches(), 1);
        session.close().unwrap();
        assert_eq!(device.active_searches(), 0);
        assert_eq!(device.open_sessions(), 0);
    }

    #[test]
    fn sessions_on_a_slot_share_one_login() {
        let device = device();
        let logins = LoginTable::new();
        let first = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        let second = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        assert_eq!(logins.holders(0), 2);

        first.close().unwrap();
        assert_eq!(logins.holders(0), 1);
        assert_eq!(device.logged_in_as(0), Some(UserType::User));
        assert!(generate_key_pair(&second).is_ok());

        second.close().unwrap();
        assert_eq!(logins.holders(0), 0);
        assert_eq!(device.logged_in_as(0), None);
        assert_eq!(device.open_sessions(), 0);
    }

    #[test]
    fn a_held_login_excludes_the_other_role() {
        let device = device();
        let logins = LoginTable::new();
        let user = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        let err =
            Session::open(&device, &logins, 0, UserType::SecurityOfficer, SO_PIN).unwrap_err();
        assert!(matches!(
            err,
            CustodyError::Device { step: Step::Login, ref source, .. }
                if source.return_value() == Some(CKR_USER_ANOTHER_ALREADY_LOGGED_IN)
        ));
        assert_eq!(device.open_sessions(), 1);
        user.close().unwrap();
    }

    #[test]
    fn a_leftover_login_is_adopted() {
        let device = device();
        let logins = LoginTable::new();
        let stale = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        device.fail_next(DeviceOperation::Logout, CKR_DEVICE_ERROR);
        device.fail_next(DeviceOperation::CloseSession, CKR_FUNCTION_FAILED);
        stale.close().unwrap_err();
        assert_eq!(logins.holders(0), 0);
        assert_eq!(device.logged_in_as(0), Some(UserType::User));

        let session = Session::open(&device, &logins, 0, UserType::User, USER_PIN).unwrap();
        assert_eq!(logins.holders(0), 1);
        session.close().unwrap();
        assert_eq!(device.logged_in_as(0), None);
    }
}
