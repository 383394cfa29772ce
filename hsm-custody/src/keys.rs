//! Key pair generation and public key decoding.

use crate::device::{
    Attribute, Device, EcKeyPairTemplate, ObjectHandle, PrivateKeyPolicy, PublicKeyPolicy,
};
use crate::error::{CustodyError, Step};
use crate::session::Session;
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use simple_asn1::{from_der, to_der, ASN1Block};
use tracing::debug;

/// DER encoding of the secp256k1 object identifier, 1.3.132.0.10.
pub const SECP256K1_EC_PARAMS: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x0a];

const UNCOMPRESSED_POINT_LEN: usize = 65;
const UNCOMPRESSED_TAG: u8 = 0x04;

/// A decoded secp256k1 public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPublicKey {
    key: PublicKey,
}

impl EcPublicKey {
    /// Parses a SEC1 encoded point, compressed or not.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, CustodyError> {
        PublicKey::from_sec1_bytes(bytes)
            .map(|key| EcPublicKey { key })
            .map_err(|_| CustodyError::MalformedKey("point is not on secp256k1"))
    }

    /// The uncompressed SEC1 encoding, `04 || x || y`.
    pub fn to_uncompressed(&self) -> [u8; UNCOMPRESSED_POINT_LEN] {
        let point = self.key.to_encoded_point(false);
        let mut bytes = [0u8; UNCOMPRESSED_POINT_LEN];
        bytes.copy_from_slice(point.as_bytes());
        bytes
    }

    /// The affine x coordinate, big-endian.
    pub fn x(&self) -> [u8; 32] {
        let mut x = [0u8; 32];
        x.copy_from_slice(&self.to_uncompressed()[1..33]);
        x
    }

    /// The affine y coordinate, big-endian.
    pub fn y(&self) -> [u8; 32] {
        let mut y = [0u8; 32];
        y.copy_from_slice(&self.to_uncompressed()[33..]);
        y
    }
}

impl From<&VerifyingKey> for EcPublicKey {
    fn from(key: &VerifyingKey) -> Self {
        EcPublicKey {
            key: PublicKey::from(key),
        }
    }
}

/// Checks that DER domain parameters name secp256k1.
pub fn decode_ec_params(raw: &[u8]) -> Result<(), CustodyError> {
    let blocks = from_der(raw).map_err(|_| CustodyError::UnsupportedCurve)?;
    match blocks.as_slice() {
        [oid @ ASN1Block::ObjectIdentifier(..)] => {
            let encoded = to_der(oid).map_err(|_| CustodyError::UnsupportedCurve)?;
            if encoded == SECP256K1_EC_PARAMS {
                Ok(())
            } else {
                Err(CustodyError::UnsupportedCurve)
            }
        }
        _ => Err(CustodyError::UnsupportedCurve),
    }
}

/// Decodes a `CKA_EC_POINT` value: a DER octet string wrapping an uncompressed
/// SEC1 point.
pub fn decode_ec_point(raw: &[u8]) -> Result<EcPublicKey, CustodyError> {
    let blocks =
        from_der(raw).map_err(|_| CustodyError::MalformedKey("point encoding is not DER"))?;
    let point = match blocks.as_slice() {
        [ASN1Block::OctetString(_, point)] => point,
        _ => return Err(CustodyError::MalformedKey("point is not an octet string")),
    };
    if point.len() != UNCOMPRESSED_POINT_LEN || point[0] != UNCOMPRESSED_TAG {
        return Err(CustodyError::MalformedKey("point is not uncompressed"));
    }
    EcPublicKey::from_sec1_bytes(point)
}

/// Decodes the public key from its `CKA_EC_PARAMS` and `CKA_EC_POINT` values.
pub fn decode_public_key(
    raw_params: &[u8],
    raw_point: &[u8],
) -> Result<EcPublicKey, CustodyError> {
    decode_ec_params(raw_params)?;
    decode_ec_point(raw_point)
}

/// Templates for a persistent secp256k1 pair whose private half can sign but
/// never leave the token.
pub fn secp256k1_key_pair_template() -> EcKeyPairTemplate {
    EcKeyPairTemplate {
        ec_params: SECP256K1_EC_PARAMS.to_vec(),
        public: PublicKeyPolicy {
            token: true,
            verify: true,
        },
        private: PrivateKeyPolicy {
            token: true,
            sign: true,
            sensitive: true,
            extractable: false,
        },
    }
}

/// Generates a secp256k1 key pair in the session's slot, returning
/// `(public, private)` handles.
pub fn generate_key_pair<D: Device + ?Sized>(
    session: &Session<'_, D>,
) -> Result<(ObjectHandle, ObjectHandle), CustodyError> {
    let handles = session
        .device()
        .generate_ec_key_pair(session.handle(), &secp256k1_key_pair_template())
        .map_err(|source| session.error(Step::GenerateKeyPair, source))?;
    debug!(slot = session.slot(), "key pair generated");
    Ok(handles)
}

/// Reads and decodes a public key object.
pub fn read_public_key<D: Device + ?Sized>(
    session: &Session<'_, D>,
    public: ObjectHandle,
) -> Result<EcPublicKey, CustodyError> {
    let read = |attribute| {
        session
            .device()
            .attribute(session.handle(), public, attribute)
            .map_err(|source| session.error(Step::ReadAttribute, source))
    };
    let params = read(Attribute::EcParams)?;
    let point = read(Attribute::EcPoint)?;
    decode_public_key(&params, &point)
}

/// Asks the device to sign a 32-byte digest, returning the raw `r || s`.
pub fn sign_digest<D: Device + ?Sized>(
    session: &Session<'_, D>,
    private: ObjectHandle,
    digest: &[u8; 32],
) -> Result<Vec<u8>, CustodyError> {
    session
        .device()
        .sign(session.handle(), private, digest)
        .map_err(|source| session.error(Step::Sign, source))
}
