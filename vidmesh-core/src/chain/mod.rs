//! On-chain client seam and the synchronous job/round helpers built on it.
//!
//! The actual client (transaction signing, event log parsing, round polling)
//! is an external collaborator behind `ChainClient`; everything here drives
//! that trait with explicit per-call deadlines.

pub mod rounds;
#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use rounds::{
    activate_transcoder, check_round_and_init, create_broadcast_job, wait_until_next_round,
    ChainTimeouts,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxHash(pub String);

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A submitted transaction awaiting a receipt.
#[derive(Clone, Debug)]
pub struct PendingTx {
    pub hash: TxHash,
    pub gas_limit: u64,
}

#[derive(Clone, Debug)]
pub struct TxReceipt {
    pub gas_used: u64,
}

/// One member of the on-chain transcoder set. Activation and deactivation
/// rounds may be unset for entries the chain has not assigned a window yet.
#[derive(Clone, Debug)]
pub struct ChainTranscoder {
    pub service_uri: String,
    pub address: String,
    pub activation_round: Option<i64>,
    pub deactivation_round: Option<i64>,
}

/// The on-chain client interface the node drives.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn account_address(&self) -> String;

    async fn token_balance(&self) -> Result<i64>;

    async fn current_round(&self) -> Result<i64>;

    async fn last_initialized_round(&self) -> Result<i64>;

    async fn current_round_initialized(&self) -> Result<bool>;

    async fn initialize_round(&self) -> Result<PendingTx>;

    /// Submit a transcode job for `stream_id` at `price`, targeting the
    /// named profile.
    async fn create_job(&self, stream_id: &str, profile: &str, price: i64) -> Result<PendingTx>;

    async fn register_transcoder(
        &self,
        fee_cut: u8,
        reward_cut: u8,
        price: i64,
    ) -> Result<PendingTx>;

    async fn bond(&self, amount: i64, to: &str) -> Result<PendingTx>;

    async fn transcoder_pool(&self) -> Result<Vec<ChainTranscoder>>;

    async fn is_active_transcoder(&self) -> Result<bool>;

    async fn transcoder_stake(&self) -> Result<i64>;

    /// Block until the transaction is mined or the timeout passes.
    async fn wait_for_receipt(&self, tx: &TxHash, timeout: Duration) -> Result<TxReceipt>;
}
