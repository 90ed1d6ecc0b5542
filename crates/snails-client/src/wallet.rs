//! Wallet bridge and permit signing.
//!
//! [`WalletBridge`] is the seam to whatever holds the user's key: a browser
//! extension in the web app, [`LocalWallet`] for headless clients and tests.
//! [`PermitSigner`] turns application messages into signed [`Permit`]s.

use std::sync::Arc;

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde_json::Value;
use tracing::{debug, info};

use snails_shared::adr36::{sign_adr36, signing_key_address};
use snails_shared::constants::ADDRESS_PREFIX;
use snails_shared::permit::{comment_permit_message, gun_permit_message, username_permit_message};
use snails_shared::{Address, Permit, PermitType, StdSignature};

use crate::error::WalletError;
use crate::permit_cache::PermitCache;

#[async_trait]
pub trait WalletBridge: Send + Sync {
    /// Ask the wallet to expose `chain_id` to this application.
    async fn enable(&self, chain_id: &str) -> Result<(), WalletError>;

    async fn accounts(&self, chain_id: &str) -> Result<Vec<Address>, WalletError>;

    /// ADR-36 signature of `data` by `signer`.
    async fn sign_arbitrary(
        &self,
        chain_id: &str,
        signer: &Address,
        data: &[u8],
    ) -> Result<StdSignature, WalletError>;
}

/// In-process secp256k1 key.
pub struct LocalWallet {
    key: SigningKey,
    address: Address,
}

impl LocalWallet {
    pub fn random() -> Result<Self, WalletError> {
        Self::from_key(SigningKey::random(&mut rand::thread_rng()))
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self, WalletError> {
        let key = SigningKey::from_slice(secret)
            .map_err(|e| WalletError::Signing(format!("invalid secret key: {e}")))?;
        Self::from_key(key)
    }

    fn from_key(key: SigningKey) -> Result<Self, WalletError> {
        let address = Address::new(signing_key_address(&key, ADDRESS_PREFIX)?);
        Ok(Self { key, address })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

#[async_trait]
impl WalletBridge for LocalWallet {
    async fn enable(&self, _chain_id: &str) -> Result<(), WalletError> {
        Ok(())
    }

    async fn accounts(&self, _chain_id: &str) -> Result<Vec<Address>, WalletError> {
        Ok(vec![self.address.clone()])
    }

    async fn sign_arbitrary(
        &self,
        _chain_id: &str,
        signer: &Address,
        data: &[u8],
    ) -> Result<StdSignature, WalletError> {
        if signer != &self.address {
            return Err(WalletError::Signing(format!("no key for {signer}")));
        }
        Ok(sign_adr36(&self.key, signer.as_str(), data))
    }
}

pub struct PermitSigner {
    wallet: Option<Arc<dyn WalletBridge>>,
    cache: Arc<PermitCache>,
    chain_id: String,
}

impl PermitSigner {
    pub fn new(
        wallet: Option<Arc<dyn WalletBridge>>,
        cache: Arc<PermitCache>,
        chain_id: impl Into<String>,
    ) -> Self {
        Self {
            wallet,
            cache,
            chain_id: chain_id.into(),
        }
    }

    pub fn cache(&self) -> &Arc<PermitCache> {
        &self.cache
    }

    pub fn has_wallet(&self) -> bool {
        self.wallet.is_some()
    }

    /// Permit for a generic graph write. Reuses a cached permit of the same
    /// type for up to an hour, whatever `data` is.
    pub async fn sign_gun_permit(
        &self,
        address: &Address,
        permit_type: PermitType,
        data: &Value,
    ) -> Result<Permit, WalletError> {
        if let Some(permit) = self.cache.get_permit(address, permit_type) {
            debug!(address = %address, permit_type = %permit_type, "Using cached permit");
            return Ok(permit);
        }

        let message = gun_permit_message(address, permit_type, data);
        let permit = self.sign(address, permit_type, &message).await?;
        self.cache.set_permit(address, permit_type, permit.clone());
        info!(address = %address, permit_type = %permit_type, "Signed and cached new permit");
        Ok(permit)
    }

    /// Permit for a display-name change. Always asks the wallet.
    pub async fn sign_username_permit(
        &self,
        address: &Address,
        username: &str,
    ) -> Result<Permit, WalletError> {
        let message = username_permit_message(address, username);
        self.sign(address, PermitType::Username, &message).await
    }

    /// Permit for a comment on a piece of content. Always asks the wallet.
    pub async fn sign_comment_permit(
        &self,
        address: &Address,
        content_id: &str,
        text: &str,
    ) -> Result<Permit, WalletError> {
        let message = comment_permit_message(address, content_id, text);
        self.sign(address, PermitType::Comment, &message).await
    }

    async fn sign(
        &self,
        address: &Address,
        permit_type: PermitType,
        message: &str,
    ) -> Result<Permit, WalletError> {
        let wallet = self.wallet.as_ref().ok_or(WalletError::Unavailable)?;
        wallet.enable(&self.chain_id).await?;
        let signature = wallet
            .sign_arbitrary(&self.chain_id, address, message.as_bytes())
            .await?;
        Ok(Permit::new(permit_type, &self.chain_id, Vec::new(), signature))
    }
}
