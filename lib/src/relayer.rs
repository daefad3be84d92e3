//! Relayer HTTP client.
//!
//! The relayer submits transfers, unshields, and swaps so the user's public
//! wallet never signs them. Its JSON API is camelCase over HTTPS. Failures
//! split into permanent (4xx: the request is wrong, surface it) and
//! transient (5xx/transport: retry with jittered backoff, three attempts).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RelayerError;
use crate::field::fr_to_bytes;
use crate::note::{parse_amount, TokenInfo};
use crate::planner::{RelayerQuote, PPM_SCALE};
use crate::witness::{SwapWitness, TransferWitness, UnshieldWitness};

/// How long a fetched quote may be reused.
const QUOTE_TTL: Duration = Duration::from_secs(60);

const RETRY_ATTEMPTS: u32 = 3;

/// Relayer responses the engine consumes.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub tx_hash: B256,
    pub leaf_index1: u32,
    pub leaf_index2: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnshieldReceipt {
    pub tx_hash: B256,
    /// Decimal string in token display units.
    pub amount_received: String,
    pub fee: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapReceipt {
    pub tx_hash: B256,
    pub leaf_index1: u32,
    pub leaf_index2: u32,
}

/// The relaying capability as the engine sees it. The HTTP client below is
/// the production implementation; tests drive an in-memory pool instead.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn quote(&self, token: &TokenInfo) -> Result<RelayerQuote, RelayerError>;
    async fn relay_transfer(
        &self,
        pool: Address,
        proof: &[u8],
        witness: &TransferWitness,
    ) -> Result<TransferReceipt, RelayerError>;
    async fn relay_unshield(
        &self,
        pool: Address,
        proof: &[u8],
        witness: &UnshieldWitness,
    ) -> Result<UnshieldReceipt, RelayerError>;
    async fn relay_swap(
        &self,
        pool: Address,
        proof: &[u8],
        witness: &SwapWitness,
    ) -> Result<SwapReceipt, RelayerError>;
    async fn is_spent(&self, pool: Address, nullifier: ark_bn254::Fr)
        -> Result<bool, RelayerError>;
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayerInfoDto {
    available: bool,
    address: Option<Address>,
    fee_percent: f64,
    min_fee: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequestDto {
    pool_address: Address,
    proof: String,
    root: String,
    nullifier_hash: String,
    output_commitment1: String,
    output_commitment2: String,
    encrypted_memo1: String,
    encrypted_memo2: String,
    fee: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnshieldRequestDto {
    pool_address: Address,
    proof: String,
    root: String,
    nullifier_hash: String,
    recipient: Address,
    token: Address,
    amount: String,
    fee: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequestDto {
    pool_address: Address,
    proof: String,
    root: String,
    nullifier_hash: String,
    token_in: Address,
    token_out: Address,
    amount_in: String,
    min_out: String,
    output_commitment1: String,
    output_commitment2: String,
}

#[derive(Deserialize)]
struct NullifierStatusDto {
    #[serde(rename = "isSpent")]
    is_spent: bool,
}

fn hex0x(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn fr0x(x: &ark_bn254::Fr) -> String {
    hex0x(&fr_to_bytes(x))
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

struct CachedQuote {
    fetched_at: Instant,
    dto_fee_percent: f64,
    dto_min_fee: String,
    relayer: Address,
}

pub struct RelayerClient {
    http: reqwest::Client,
    base_url: String,
    cache: Mutex<Option<CachedQuote>>,
}

impl RelayerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RelayerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RelayerError::Transport(e.to_string()))?;
        Ok(RelayerClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Bucket an HTTP response: permanent rejections pass through the
    /// error-message classifier so stale roots and double spends keep
    /// their identity.
    async fn classify<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RelayerError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| RelayerError::BadResponse(e.to_string()));
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            let lower = message.to_lowercase();
            if lower.contains("root") && (lower.contains("not found") || lower.contains("unknown"))
            {
                return Err(RelayerError::RootNotFound);
            }
            if lower.contains("spent") {
                return Err(RelayerError::AlreadySpent);
            }
            return Err(RelayerError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Err(RelayerError::Transport(format!("{status}: {message}")))
    }

    /// POST with up to three attempts on transient failures.
    async fn post_retrying<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RelayerError> {
        let url = self.url(path);
        let mut last = RelayerError::Transport("no attempt made".into());
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                let base = 500u64 << attempt;
                let jitter = rand::thread_rng().gen_range(0..250);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            let sent = self.http.post(&url).json(body).send().await;
            match sent {
                Err(e) => {
                    warn!(attempt, error = %e, "relayer transport failure");
                    last = RelayerError::Transport(e.to_string());
                }
                Ok(response) => match Self::classify::<T>(response).await {
                    Err(RelayerError::Transport(msg)) => {
                        warn!(attempt, error = %msg, "relayer transient failure");
                        last = RelayerError::Transport(msg);
                    }
                    other => return other,
                },
            }
        }
        Err(last)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RelayerError> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| RelayerError::Transport(e.to_string()))?;
        Self::classify(response).await
    }

    /// Fetch `/relay/info`, reusing a quote younger than a minute.
    async fn info(&self) -> Result<(f64, String, Address), RelayerError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < QUOTE_TTL {
                    return Ok((
                        cached.dto_fee_percent,
                        cached.dto_min_fee.clone(),
                        cached.relayer,
                    ));
                }
            }
        }
        let dto: RelayerInfoDto = self.get_json("/api/shielded/relay/info").await?;
        if !dto.available {
            return Err(RelayerError::Unavailable);
        }
        let relayer = dto.address.ok_or(RelayerError::Unavailable)?;
        debug!(fee_percent = dto.fee_percent, min_fee = %dto.min_fee, "refreshed relayer quote");
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        *cache = Some(CachedQuote {
            fetched_at: Instant::now(),
            dto_fee_percent: dto.fee_percent,
            dto_min_fee: dto.min_fee.clone(),
            relayer,
        });
        Ok((dto.fee_percent, dto.min_fee, relayer))
    }
}

/// Convert the wire fee rate to integer parts-per-million. The only place
/// a float touches fee math; everything downstream is U256.
fn fee_percent_to_ppm(fee_percent: f64) -> u64 {
    (fee_percent * PPM_SCALE as f64).round() as u64
}

#[async_trait]
impl Relay for RelayerClient {
    async fn quote(&self, token: &TokenInfo) -> Result<RelayerQuote, RelayerError> {
        let (fee_percent, min_fee, relayer) = self.info().await?;
        let min_fee = parse_amount(&min_fee, token.decimals)
            .map_err(|e| RelayerError::BadResponse(format!("minFee: {e}")))?;
        Ok(RelayerQuote {
            fee_ppm: fee_percent_to_ppm(fee_percent),
            min_fee,
            relayer,
        })
    }

    async fn relay_transfer(
        &self,
        pool: Address,
        proof: &[u8],
        witness: &TransferWitness,
    ) -> Result<TransferReceipt, RelayerError> {
        let request = TransferRequestDto {
            pool_address: pool,
            proof: hex0x(proof),
            root: fr0x(&witness.root),
            nullifier_hash: fr0x(&witness.nullifier),
            output_commitment1: fr0x(&witness.out_commitments[0]),
            output_commitment2: fr0x(&witness.out_commitments[1]),
            encrypted_memo1: hex0x(&witness.memos[0]),
            encrypted_memo2: hex0x(&witness.memos[1]),
            fee: witness.fee.to_string(),
        };
        self.post_retrying("/api/shielded/relay/transfer", &request)
            .await
    }

    async fn relay_unshield(
        &self,
        pool: Address,
        proof: &[u8],
        witness: &UnshieldWitness,
    ) -> Result<UnshieldReceipt, RelayerError> {
        let request = UnshieldRequestDto {
            pool_address: pool,
            proof: hex0x(proof),
            root: fr0x(&witness.root),
            nullifier_hash: fr0x(&witness.nullifier),
            recipient: witness.recipient,
            token: witness.token,
            amount: witness.net_amount.to_string(),
            fee: witness.fee.to_string(),
        };
        self.post_retrying("/api/shielded/relay/unshield", &request)
            .await
    }

    async fn relay_swap(
        &self,
        pool: Address,
        proof: &[u8],
        witness: &SwapWitness,
    ) -> Result<SwapReceipt, RelayerError> {
        let request = SwapRequestDto {
            pool_address: pool,
            proof: hex0x(proof),
            root: fr0x(&witness.root),
            nullifier_hash: fr0x(&witness.nullifier),
            token_in: witness.token_in,
            token_out: witness.token_out,
            amount_in: witness.amount_in.to_string(),
            min_out: witness.min_out.to_string(),
            output_commitment1: fr0x(&witness.out_commitments[0]),
            output_commitment2: fr0x(&witness.out_commitments[1]),
        };
        self.post_retrying("/api/shielded/relay/swap", &request)
            .await
    }

    async fn is_spent(
        &self,
        pool: Address,
        nullifier: ark_bn254::Fr,
    ) -> Result<bool, RelayerError> {
        let path = format!(
            "/api/shielded/pool/{pool:#x}/nullifier/{}",
            hex0x(&fr_to_bytes(&nullifier))
        );
        let dto: NullifierStatusDto = self.get_json(&path).await?;
        Ok(dto.is_spent)
    }
}
