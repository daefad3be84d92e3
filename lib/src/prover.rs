//! The external proving capability.
//!
//! Proof generation is not this crate's business: the host supplies
//! something that turns a circuit input map into Groth16 proof bytes —
//! typically a proving service, possibly a local snarkjs child process.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ProveError;
use crate::witness::CircuitInputs;

#[async_trait]
pub trait Prover: Send + Sync {
    /// Produce the proof bytes the pool contract verifies on-chain.
    async fn prove(&self, inputs: &CircuitInputs) -> Result<Vec<u8>, ProveError>;
}

/// HTTP prover client: `POST {base}/prove/{circuit}` with the signal map,
/// expecting `{ "proof": "0x…" }`.
pub struct HttpProver {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ProofResponse {
    proof: String,
}

impl HttpProver {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProveError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| ProveError::Prover(e.to_string()))?;
        Ok(HttpProver {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Prover for HttpProver {
    async fn prove(&self, inputs: &CircuitInputs) -> Result<Vec<u8>, ProveError> {
        let url = format!("{}/prove/{}", self.base_url, inputs.circuit.name());
        let body: serde_json::Value = serde_json::from_str(&inputs.to_json())
            .map_err(|e| ProveError::Prover(e.to_string()))?;
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProveError::Prover(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProveError::Prover(format!(
                "prover returned {}",
                response.status()
            )));
        }
        let parsed: ProofResponse = response
            .json()
            .await
            .map_err(|e| ProveError::Prover(e.to_string()))?;
        let raw = parsed.proof.trim_start_matches("0x");
        hex::decode(raw).map_err(|e| ProveError::Prover(format!("bad proof hex: {e}")))
    }
}
