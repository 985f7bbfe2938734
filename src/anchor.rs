//! Optional threshold-encryption anchor writer.
//!
//! When configured, the gateway records encrypted request intents on-chain
//! before payment and reveals them after settlement. The writer is not on
//! the request hot path: the pipeline enqueues jobs fire-and-forget and a
//! single worker drains them strictly in FIFO order over one EVM wallet.
//!
//! The worker manages its own nonce counter: initialized from the chain's
//! pending transaction count on first use, incremented locally per job, and
//! reset to force a fresh query whenever a transaction fails. Each job
//! awaits its receipt before the next starts, so the shared wallet never
//! races itself into nonce collisions.

use alloy::network::TransactionBuilder;
use alloy::primitives::B256;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolCall;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::AnchorConfig;

sol! {
    function storeIntent(bytes32 id, bytes32 digest);
    function revealIntent(bytes32 id);
}

/// One unit of work for the anchor worker.
#[derive(Debug, Clone)]
pub enum AnchorJob {
    /// Record the encrypted intent digest before payment.
    Store { request_id: Uuid, digest: B256 },
    /// Reveal the intent after settlement.
    Reveal { request_id: Uuid },
}

impl AnchorJob {
    fn intent_id(request_id: &Uuid) -> B256 {
        let mut id = [0u8; 32];
        id[..16].copy_from_slice(request_id.as_bytes());
        B256::from(id)
    }

    fn calldata(&self) -> Vec<u8> {
        match self {
            AnchorJob::Store { request_id, digest } => storeIntentCall {
                id: Self::intent_id(request_id),
                digest: *digest,
            }
            .abi_encode(),
            AnchorJob::Reveal { request_id } => revealIntentCall {
                id: Self::intent_id(request_id),
            }
            .abi_encode(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    #[error("invalid anchor private key: {0}")]
    InvalidKey(String),
}

/// Handle the pipeline uses to enqueue anchor jobs without blocking.
#[derive(Clone)]
pub struct AnchorHandle {
    tx: mpsc::UnboundedSender<AnchorJob>,
}

impl AnchorHandle {
    /// Enqueue a job. Dropped silently once the worker has shut down.
    pub fn submit(&self, job: AnchorJob) {
        if self.tx.send(job).is_err() {
            tracing::debug!("anchor worker gone, dropping job");
        }
    }
}

/// Start the anchor worker on the tracker and return its handle.
///
/// The worker registers with the tracker so shutdown waits for an
/// in-flight transaction to reach its receipt instead of abandoning it.
pub fn spawn(
    config: AnchorConfig,
    token: CancellationToken,
    tracker: &TaskTracker,
) -> Result<AnchorHandle, AnchorError> {
    let signer = PrivateKeySigner::from_str(&config.private_key)
        .map_err(|e| AnchorError::InvalidKey(e.to_string()))?;
    let wallet_address = signer.address();
    let provider = ProviderBuilder::new()
        .wallet(signer)
        .connect_http(config.rpc_url.clone());
    let contract = config.contract;
    let (tx, mut rx) = mpsc::unbounded_channel::<AnchorJob>();

    tracker.spawn(async move {
        // Local nonce cache; None forces a pending-count query.
        let mut nonce: Option<u64> = None;
        loop {
            let job = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("anchor worker stopped");
                    break;
                }
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let next_nonce = match nonce {
                Some(n) => n + 1,
                None => {
                    match provider
                        .get_transaction_count(wallet_address)
                        .pending()
                        .await
                    {
                        Ok(count) => count,
                        Err(e) => {
                            tracing::warn!(error = %e, "anchor nonce query failed, dropping job");
                            continue;
                        }
                    }
                }
            };

            let request = TransactionRequest::default()
                .with_from(wallet_address)
                .with_to(contract)
                .with_nonce(next_nonce)
                .with_input(job.calldata());

            let pending = match provider.send_transaction(request).await {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(error = %e, "anchor transaction submission failed");
                    // State on-chain is uncertain; requery before the next job.
                    nonce = None;
                    continue;
                }
            };

            match pending.get_receipt().await {
                Ok(receipt) => {
                    nonce = Some(next_nonce);
                    tracing::debug!(
                        tx = %receipt.transaction_hash,
                        nonce = next_nonce,
                        "anchor job confirmed"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "anchor receipt fetch failed");
                    nonce = None;
                }
            }
        }
    });

    Ok(AnchorHandle { tx })
}

/// Parse a `0x`-prefixed digest into the on-chain representation.
pub fn digest_to_b256(hex_digest: &str) -> Option<B256> {
    B256::from_str(hex_digest).ok()
}
