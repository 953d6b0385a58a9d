//! Round helpers and the broadcast-job / transcoder-activation drivers.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config;
use crate::error::{Error, Result};

use super::{ChainClient, TxHash};

/// How often the round number is polled while waiting for a transition.
const ROUND_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
pub struct ChainTimeouts {
    /// Per-RPC deadline.
    pub rpc: Duration,
    /// Deadline for a transaction to be mined.
    pub mined_tx: Duration,
    /// Round length in blocks.
    pub round_length: i64,
    /// Upper bound on waiting for the next round to start.
    pub round_wait: Duration,
}

impl Default for ChainTimeouts {
    fn default() -> Self {
        Self {
            rpc: Duration::from_secs(5),
            mined_tx: Duration::from_secs(60),
            round_length: 20,
            round_wait: Duration::from_secs(300),
        }
    }
}

impl ChainTimeouts {
    pub fn from_config(cfg: &config::ChainConfig) -> Self {
        Self {
            rpc: Duration::from_secs(cfg.rpc_timeout_secs),
            mined_tx: Duration::from_secs(cfg.mined_tx_timeout_secs),
            round_length: cfg.round_length,
            ..Self::default()
        }
    }
}

async fn rpc<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout),
    }
}

/// Poll the round number until it advances past the current one. Returns
/// `Timeout` when the overall bound passes and `Canceled` on cancellation.
pub async fn wait_until_next_round(
    chain: &dyn ChainClient,
    timeouts: &ChainTimeouts,
    cancel: &CancellationToken,
) -> Result<()> {
    let start_round = rpc(timeouts.rpc, chain.current_round()).await?;
    let deadline = tokio::time::Instant::now() + timeouts.round_wait;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Canceled),
            () = tokio::time::sleep(ROUND_POLL_INTERVAL) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        let round = rpc(timeouts.rpc, chain.current_round()).await?;
        if round > start_round {
            info!("round transition {} -> {}", start_round, round);
            return Ok(());
        }
    }
}

/// Submit a round initialization if the current round is uninitialized on
/// chain, and wait for it to be mined.
pub async fn check_round_and_init(chain: &dyn ChainClient, timeouts: &ChainTimeouts) -> Result<()> {
    if rpc(timeouts.rpc, chain.current_round_initialized()).await? {
        return Ok(());
    }
    info!("current round uninitialized, submitting init");
    let tx = rpc(timeouts.rpc, chain.initialize_round()).await?;
    chain.wait_for_receipt(&tx.hash, timeouts.mined_tx).await?;
    Ok(())
}

/// Submit a transcode job and confirm the receipt. A receipt whose gas used
/// equals the gas limit is a revert and reported as a broadcast failure.
pub async fn create_broadcast_job(
    chain: &dyn ChainClient,
    timeouts: &ChainTimeouts,
    stream_id: &str,
    profile: &str,
    price: i64,
) -> Result<TxHash> {
    check_round_and_init(chain, timeouts).await?;

    let tx = match rpc(timeouts.rpc, chain.create_job(stream_id, profile, price)).await {
        Ok(tx) => tx,
        Err(e) => {
            error!("job submission failed: {}", e);
            return Err(Error::Broadcast);
        }
    };
    let receipt = match chain.wait_for_receipt(&tx.hash, timeouts.mined_tx).await {
        Ok(receipt) => receipt,
        Err(e) => {
            error!("job receipt failed: {}", e);
            return Err(Error::Broadcast);
        }
    };
    if receipt.gas_used == tx.gas_limit {
        error!("job creation reverted, tx {}", tx.hash);
        return Err(Error::Broadcast);
    }
    Ok(tx.hash)
}

/// Multi-step on-chain transcoder activation: wait for a fresh round,
/// initialize it if needed, register, then self-bond. Every mined receipt is
/// revert-checked the same way job creation is.
pub async fn activate_transcoder(
    chain: &dyn ChainClient,
    timeouts: &ChainTimeouts,
    fee_cut: u8,
    reward_cut: u8,
    price: i64,
    stake: i64,
    cancel: &CancellationToken,
) -> Result<()> {
    if rpc(timeouts.rpc, chain.is_active_transcoder()).await? {
        return Err(Error::AlreadyExists);
    }

    wait_until_next_round(chain, timeouts, cancel).await?;
    check_round_and_init(chain, timeouts).await?;

    let tx = rpc(
        timeouts.rpc,
        chain.register_transcoder(fee_cut, reward_cut, price),
    )
    .await?;
    let receipt = chain.wait_for_receipt(&tx.hash, timeouts.mined_tx).await?;
    if receipt.gas_used == tx.gas_limit {
        return Err(Error::Chain("transcoder registration reverted".into()));
    }

    check_round_and_init(chain, timeouts).await?;
    let self_addr = chain.account_address();
    let tx = rpc(timeouts.rpc, chain.bond(stake, &self_addr)).await?;
    let receipt = chain.wait_for_receipt(&tx.hash, timeouts.mined_tx).await?;
    if receipt.gas_used == tx.gas_limit {
        return Err(Error::Chain("self-bond reverted".into()));
    }

    let total_stake = rpc(timeouts.rpc, chain.transcoder_stake()).await?;
    info!("transcoder active, total stake {}", total_stake);
    Ok(())
}
