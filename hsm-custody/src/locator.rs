//! Finding key objects within a session.

use crate::device::{Device, ObjectClass, ObjectHandle, ObjectTemplate};
use crate::error::CustodyError;
use crate::session::Session;
use tracing::debug;

/// Finds the first EC key object of `class` in the session's slot.
///
/// A slot is expected to hold one key pair; when it holds several, the first
/// object the device returns wins. The search is cancelled before returning.
pub fn find_key<D: Device + ?Sized>(
    session: &Session<'_, D>,
    class: ObjectClass,
) -> Result<ObjectHandle, CustodyError> {
    let found = {
        let cursor = session.find_objects(&ObjectTemplate::ec(class))?;
        cursor.next_batch(1)?
    };
    let handle = found.first().copied().ok_or(CustodyError::KeyNotFound {
        slot: session.slot(),
        class,
    })?;
    debug!(slot = session.slot(), object = handle, %class, "key located");
    Ok(handle)
}

/// Finds the slot's EC public key object.
pub fn find_public_key<D: Device + ?Sized>(
    session: &Session<'_, D>,
) -> Result<ObjectHandle, CustodyError> {
    find_key(session, ObjectClass::PublicKey)
}

/// Finds the slot's EC private key object.
pub fn find_private_key<D: Device + ?Sized>(
    session: &Session<'_, D>,
) -> Result<ObjectHandle, CustodyError> {
    find_key(session, ObjectClass::PrivateKey)
}
