//! The wallet capability.
//!
//! Only two things ever reach the user's public wallet: the identity
//! signature at unlock, and shield deposits. Everything else goes through
//! the relayer precisely so the public wallet never signs it.

use alloy::{
    network::EthereumWallet,
    primitives::{Address, B256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::{local::PrivateKeySigner, Signer},
};
use async_trait::async_trait;

use crate::chain::submit_tx_request;
use crate::error::ChainError;
use crate::witness::TxRequest;

#[async_trait]
pub trait WalletConnector: Send + Sync {
    fn address(&self) -> Address;
    /// EIP-191 personal-message signature over the identity message.
    async fn sign_message(&self, message: &str) -> Result<Vec<u8>, ChainError>;
    async fn send_transaction(&self, request: &TxRequest) -> Result<B256, ChainError>;
}

/// A locally held private key behind its own signing provider. Suits the
/// CLI; browser hosts implement [`WalletConnector`] over their injected
/// wallet instead.
pub struct LocalWallet {
    signer: PrivateKeySigner,
    provider: DynProvider,
}

impl LocalWallet {
    pub fn connect(rpc_url: &str, private_key: &str) -> Result<Self, ChainError> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|_| ChainError::Rpc("invalid private key".into()))?;
        let url = rpc_url
            .parse()
            .map_err(|e| ChainError::Rpc(format!("bad rpc url: {e}")))?;
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer.clone()))
            .connect_http(url)
            .erased();
        Ok(LocalWallet { signer, provider })
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }
}

#[async_trait]
impl WalletConnector for LocalWallet {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_message(&self, message: &str) -> Result<Vec<u8>, ChainError> {
        let signature = self
            .signer
            .sign_message(message.as_bytes())
            .await
            .map_err(|e| ChainError::Rpc(format!("sign_message: {e}")))?;
        Ok(signature.as_bytes().to_vec())
    }

    async fn send_transaction(&self, request: &TxRequest) -> Result<B256, ChainError> {
        submit_tx_request(&self.provider, request).await
    }
}
