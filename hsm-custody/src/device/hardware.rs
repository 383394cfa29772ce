use super::{
    Attribute, Device, DeviceError, EcKeyPairTemplate, ObjectHandle, ObjectTemplate,
    SessionHandle, SlotId, TokenInfo, UserType,
};

use pkcs11::types::{
    CKA_CLASS, CKA_EC_PARAMS, CKA_EXTRACTABLE, CKA_KEY_TYPE, CKA_SENSITIVE, CKA_SIGN, CKA_TOKEN,
    CKA_VERIFY, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKF_TOKEN_INITIALIZED, CKK_EC, CKM_ECDSA,
    CKM_EC_KEY_PAIR_GEN, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKR_ATTRIBUTE_TYPE_INVALID, CKR_OK,
    CK_ATTRIBUTE, CK_BBOOL, CK_FALSE, CK_KEY_TYPE, CK_MECHANISM, CK_MECHANISM_TYPE,
    CK_OBJECT_CLASS, CK_TOKEN_INFO, CK_TRUE, CK_ULONG,
};
use pkcs11::Ctx;
use std::fmt;
use std::path::Path;
use std::ptr;

/// A token reached through a PKCS#11 module (CloudHSM, SoftHSM, a smart card, ...).
pub struct Pkcs11Device {
    ctx: Ctx,
}

impl Pkcs11Device {
    /// Loads and initializes the PKCS#11 module at `filename`.
    // e.g. /opt/cloudhsm/lib/libcloudhsm_pkcs11.so or /usr/lib/softhsm/libsofthsm2.so
    pub fn new<P>(filename: P) -> Result<Pkcs11Device, DeviceError>
    where
        P: AsRef<Path>,
    {
        let ctx = Ctx::new_and_initialize(filename)?;
        Ok(Pkcs11Device { ctx })
    }
}

impl fmt::Debug for Pkcs11Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Device").finish_non_exhaustive()
    }
}

fn mechanism(mechanism: CK_MECHANISM_TYPE) -> CK_MECHANISM {
    CK_MECHANISM {
        mechanism,
        pParameter: ptr::null_mut(),
        ulParameterLen: 0,
    }
}

/// The blank padding of the label is stripped.
fn parse_token_info(info: &CK_TOKEN_INFO) -> TokenInfo {
    TokenInfo {
        label: String::from(info.label),
        initialized: info.flags & CKF_TOKEN_INITIALIZED != 0,
    }
}

fn flag(value: bool) -> CK_BBOOL {
    if value {
        CK_TRUE
    } else {
        CK_FALSE
    }
}

impl Device for Pkcs11Device {
    fn slots(&self) -> Result<Vec<SlotId>, DeviceError> {
        Ok(self.ctx.get_slot_list(true)?)
    }

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, DeviceError> {
        let info = self.ctx.get_token_info(slot)?;
        Ok(parse_token_info(&info))
    }

    fn init_token(&self, slot: SlotId, so_pin: &str, label: &str) -> Result<(), DeviceError> {
        Ok(self.ctx.init_token(slot, Some(so_pin), label)?)
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, DeviceError> {
        let flags = CKF_SERIAL_SESSION | CKF_RW_SESSION;
        let application = None;
        let notify = None;
        Ok(self.ctx.open_session(slot, flags, application, notify)?)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), DeviceError> {
        Ok(self.ctx.close_session(session)?)
    }

    fn login(&self, session: SessionHandle, user: UserType, pin: &str) -> Result<(), DeviceError> {
        Ok(self.ctx.login(session, user.into(), Some(pin))?)
    }

    fn logout(&self, session: SessionHandle) -> Result<(), DeviceError> {
        Ok(self.ctx.logout(session)?)
    }

    fn init_pin(&self, session: SessionHandle, pin: &str) -> Result<(), DeviceError> {
        Ok(self.ctx.init_pin(session, Some(pin))?)
    }

    fn find_objects_init(
        &self,
        session: SessionHandle,
        template: &ObjectTemplate,
    ) -> Result<(), DeviceError> {
        let key_type: CK_KEY_TYPE = CKK_EC;
        let class: CK_OBJECT_CLASS = template.class.ck_class();
        let attributes = [
            CK_ATTRIBUTE::new(CKA_KEY_TYPE).with_ck_ulong(&key_type),
            CK_ATTRIBUTE::new(CKA_CLASS).with_ck_ulong(&class),
        ];
        Ok(self.ctx.find_objects_init(session, &attributes)?)
    }

    fn find_objects(
        &self,
        session: SessionHandle,
        max: usize,
    ) -> Result<Vec<ObjectHandle>, DeviceError> {
        Ok(self.ctx.find_objects(session, max as CK_ULONG)?)
    }

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), DeviceError> {
        Ok(self.ctx.find_objects_final(session)?)
    }

    fn attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: Attribute,
    ) -> Result<Vec<u8>, DeviceError> {
        // First pass reads the length, second pass fills the buffer.
        let mut length_attrs = vec![CK_ATTRIBUTE::new(attribute.ck_type())];
        let (rv, lengths) = self
            .ctx
            .get_attribute_value(session, object, &mut length_attrs)?;
        if rv != CKR_OK {
            return Err(DeviceError::ReturnValue(rv));
        }
        let length = lengths
            .first()
            .map(|attr| attr.ulValueLen)
            .ok_or(DeviceError::ReturnValue(CKR_ATTRIBUTE_TYPE_INVALID))?;
        if length == CK_ULONG::MAX {
            return Err(DeviceError::ReturnValue(CKR_ATTRIBUTE_TYPE_INVALID));
        }

        let value = vec![0u8; length as usize];
        let mut value_attrs =
            vec![CK_ATTRIBUTE::new(attribute.ck_type()).with_bytes(value.as_slice())];
        let (rv, _) = self
            .ctx
            .get_attribute_value(session, object, &mut value_attrs)?;
        if rv != CKR_OK {
            return Err(DeviceError::ReturnValue(rv));
        }
        Ok(value)
    }

    fn generate_ec_key_pair(
        &self,
        session: SessionHandle,
        template: &EcKeyPairTemplate,
    ) -> Result<(ObjectHandle, ObjectHandle), DeviceError> {
        let public_class: CK_OBJECT_CLASS = CKO_PUBLIC_KEY;
        let private_class: CK_OBJECT_CLASS = CKO_PRIVATE_KEY;
        let key_type: CK_KEY_TYPE = CKK_EC;
        let public_token = flag(template.public.token);
        let verify = flag(template.public.verify);
        let private_token = flag(template.private.token);
        let sign = flag(template.private.sign);
        let sensitive = flag(template.private.sensitive);
        let extractable = flag(template.private.extractable);

        let public = [
            CK_ATTRIBUTE::new(CKA_CLASS).with_ck_ulong(&public_class),
            CK_ATTRIBUTE::new(CKA_KEY_TYPE).with_ck_ulong(&key_type),
            CK_ATTRIBUTE::new(CKA_TOKEN).with_bool(&public_token),
            CK_ATTRIBUTE::new(CKA_VERIFY).with_bool(&verify),
            CK_ATTRIBUTE::new(CKA_EC_PARAMS).with_bytes(template.ec_params.as_slice()),
        ];
        let private = [
            CK_ATTRIBUTE::new(CKA_CLASS).with_ck_ulong(&private_class),
            CK_ATTRIBUTE::new(CKA_KEY_TYPE).with_ck_ulong(&key_type),
            CK_ATTRIBUTE::new(CKA_TOKEN).with_bool(&private_token),
            CK_ATTRIBUTE::new(CKA_SIGN).with_bool(&sign),
            CK_ATTRIBUTE::new(CKA_SENSITIVE).with_bool(&sensitive),
            CK_ATTRIBUTE::new(CKA_EXTRACTABLE).with_bool(&extractable),
        ];

        Ok(self.ctx.generate_key_pair(
            session,
            &mechanism(CKM_EC_KEY_PAIR_GEN),
            &public,
            &private,
        )?)
    }

    fn sign(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        self.ctx.sign_init(session, &mechanism(CKM_ECDSA), key)?;
        Ok(self.ctx.sign(session, data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkcs11::types::padding::BlankPaddedUtf8String32;

    #[test]
    fn token_labels_lose_their_padding() {
        let mut label = [b' '; 32];
        label[..10].copy_from_slice(b"treasury-1");
        let info = CK_TOKEN_INFO {
            label: BlankPaddedUtf8String32(label),
            flags: CKF_TOKEN_INITIALIZED,
            ..CK_TOKEN_INFO::default()
        };
        let parsed = parse_token_info(&info);
        assert_eq!(parsed.label, "treasury-1");
        assert!(parsed.initialized);

        let blank = parse_token_info(&CK_TOKEN_INFO::default());
        assert_eq!(blank.label, "");
        assert!(!blank.initialized);
    }

    #[test]
    fn flags_map_to_ck_bbool() {
        assert_eq!(flag(true), CK_TRUE);
        assert_eq!(flag(false), CK_FALSE);
    }

    #[test]
    fn missing_module_is_a_module_error() {
        let err = Pkcs11Device::new("/nonexistent/libpkcs11-module.so").unwrap_err();
        assert!(err.return_value().is_none());
    }
}
