//! Network membership passports.
//!
//! A passport certifies that a public key may participate in a named
//! network with enumerated capabilities. The network owner signs passports
//! directly; a holder whose passport carries `allow_sign` may certify
//! further passports, forming a short delegation chain that is carried
//! inline and verified back to the owner key.

use crate::crypto::{CryptoError, KeyPair, PublicKey};
use crate::types::Signature;
use serde::{Deserialize, Serialize};

/// Capability bits granted by a passport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// May mutate blocks in the network.
    pub allow_write: bool,
    /// May contribute storage (run a serving node).
    pub allow_storage: bool,
    /// May sign further passports.
    pub allow_sign: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { allow_write: true, allow_storage: true, allow_sign: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passport {
    pub user: PublicKey,
    pub network: String,
    pub capabilities: Capabilities,
    /// Present when signed by a delegate rather than the owner; the
    /// delegate's own passport rides along for verification.
    pub issuer: Option<Box<Passport>>,
    pub signature: Signature,
}

impl Passport {
    /// Canonical bytes covered by the signature.
    fn signed_bytes(user: &PublicKey, network: &str, caps: &Capabilities) -> Vec<u8> {
        let mut bytes = user.digest().to_vec();
        bytes.extend_from_slice(network.as_bytes());
        bytes.push(caps.allow_write as u8);
        bytes.push(caps.allow_storage as u8);
        bytes.push(caps.allow_sign as u8);
        bytes
    }

    /// Issue a passport signed by the network owner.
    pub fn issue(
        owner: &KeyPair,
        user: PublicKey,
        network: impl Into<String>,
        capabilities: Capabilities,
    ) -> Self {
        let network = network.into();
        let signature = owner.sign(&Self::signed_bytes(&user, &network, &capabilities));
        Self { user, network, capabilities, issuer: None, signature }
    }

    /// Issue a delegated passport. The delegate's passport must carry
    /// `allow_sign`; it is embedded so the chain verifies standalone.
    pub fn delegate(
        signer: &KeyPair,
        signer_passport: &Passport,
        user: PublicKey,
        capabilities: Capabilities,
    ) -> Self {
        let network = signer_passport.network.clone();
        let signature = signer.sign(&Self::signed_bytes(&user, &network, &capabilities));
        Self {
            user,
            network,
            capabilities,
            issuer: Some(Box::new(signer_passport.clone())),
            signature,
        }
    }

    /// Verify the signature chain up to the network owner key and check
    /// the required capabilities.
    pub fn verify(
        &self,
        owner: &PublicKey,
        require_write: bool,
        require_storage: bool,
        require_sign: bool,
    ) -> Result<(), CryptoError> {
        let bytes = Self::signed_bytes(&self.user, &self.network, &self.capabilities);
        match &self.issuer {
            None => owner.verify(&bytes, &self.signature)?,
            Some(issuer) => {
                // Delegation: the issuer passport must verify and carry
                // the signing capability, and its network must match.
                if issuer.network != self.network {
                    return Err(CryptoError::InvalidSignature);
                }
                issuer.verify(owner, false, false, true)?;
                issuer.user.verify(&bytes, &self.signature)?;
            }
        }
        let caps = &self.capabilities;
        if (require_write && !caps.allow_write)
            || (require_storage && !caps.allow_storage)
            || (require_sign && !caps.allow_sign)
        {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_signed_passport_verifies() {
        let owner = KeyPair::generate();
        let user = KeyPair::generate();
        let p = Passport::issue(
            &owner,
            user.public().clone(),
            "testnet",
            Capabilities::default(),
        );
        assert!(p.verify(owner.public(), true, true, false).is_ok());
        // Default capabilities do not include signing.
        assert!(p.verify(owner.public(), false, false, true).is_err());

        let stranger = KeyPair::generate();
        assert!(p.verify(stranger.public(), false, false, false).is_err());
    }

    #[test]
    fn delegated_passport_chains_to_owner() {
        let owner = KeyPair::generate();
        let delegate = KeyPair::generate();
        let user = KeyPair::generate();

        let caps_sign = Capabilities { allow_sign: true, ..Capabilities::default() };
        let delegate_passport =
            Passport::issue(&owner, delegate.public().clone(), "testnet", caps_sign);
        let p = Passport::delegate(
            &delegate,
            &delegate_passport,
            user.public().clone(),
            Capabilities::default(),
        );
        assert!(p.verify(owner.public(), true, false, false).is_ok());
    }

    #[test]
    fn delegation_without_sign_capability_fails() {
        let owner = KeyPair::generate();
        let delegate = KeyPair::generate();
        let user = KeyPair::generate();

        let delegate_passport = Passport::issue(
            &owner,
            delegate.public().clone(),
            "testnet",
            Capabilities::default(),
        );
        let p = Passport::delegate(
            &delegate,
            &delegate_passport,
            user.public().clone(),
            Capabilities::default(),
        );
        assert!(p.verify(owner.public(), false, false, false).is_err());
    }
}
