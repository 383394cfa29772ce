//! Authorization hook consulted before an address is created or a transaction
//! is signed.
//!
//! The engine ships with [`AllowAll`]. Approval or quorum gating is added by
//! installing another [`Policy`] with
//! [`SigningEngine::with_policy`](crate::SigningEngine::with_policy); closures
//! of the right shape are policies too.

use crate::transaction::UnsignedTransaction;
use thiserror::Error;

/// An operation awaiting authorization.
#[derive(Debug, Clone, Copy)]
pub enum PolicyRequest<'a> {
    /// Provisioning a new slot and key pair under `label`.
    CreateAddress {
        /// The requested label.
        label: &'a str,
    },
    /// Signing `transaction` for `chain_id` with the key under `label`.
    SignTransaction {
        /// The signing key's label.
        label: &'a str,
        /// The EIP-155 chain id.
        chain_id: u64,
        /// The transaction to sign.
        transaction: &'a UnsignedTransaction,
    },
}

impl PolicyRequest<'_> {
    /// The label the request targets.
    pub fn label(&self) -> &str {
        match self {
            PolicyRequest::CreateAddress { label } => label,
            PolicyRequest::SignTransaction { label, .. } => label,
        }
    }
}

/// A refusal issued by a [`Policy`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct PolicyDenial {
    /// Why the request was refused.
    pub reason: String,
}

impl PolicyDenial {
    /// Creates a denial with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Decides whether a sensitive operation may proceed. It runs before any
/// device state is touched.
pub trait Policy: Send + Sync {
    /// Returns `Err` to refuse the request.
    fn check(&self, request: &PolicyRequest<'_>) -> Result<(), PolicyDenial>;
}

impl<F> Policy for F
where
    F: Fn(&PolicyRequest<'_>) -> Result<(), PolicyDenial> + Send + Sync,
{
    fn check(&self, request: &PolicyRequest<'_>) -> Result<(), PolicyDenial> {
        self(request)
    }
}

/// Permits every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn check(&self, _request: &PolicyRequest<'_>) -> Result<(), PolicyDenial> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_policies() {
        let deny_cold = |request: &PolicyRequest<'_>| {
            if request.label().starts_with("cold-") {
                Err(PolicyDenial::new("cold storage requires approval"))
            } else {
                Ok(())
            }
        };
        let hot = PolicyRequest::CreateAddress { label: "hot-1" };
        let cold = PolicyRequest::CreateAddress { label: "cold-1" };
        assert!(deny_cold.check(&hot).is_ok());
        assert_eq!(
            deny_cold.check(&cold).unwrap_err().to_string(),
            "cold storage requires approval"
        );
        assert!(AllowAll.check(&cold).is_ok());
    }
}
