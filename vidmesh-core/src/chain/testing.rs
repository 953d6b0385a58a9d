//! Scripted chain client for unit tests: rounds advance on demand and job
//! submissions succeed or revert according to a queue of outcomes.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

use super::{ChainClient, ChainTranscoder, PendingTx, TxHash, TxReceipt};

pub(crate) struct MockChain {
    pub round: AtomicI64,
    pub initialized: AtomicBool,
    pub balance: AtomicI64,
    /// Outcomes for successive `create_job` calls: true = revert.
    pub job_reverts: Mutex<Vec<bool>>,
    pub jobs_created: AtomicI64,
    pub advance_round_on_wait: bool,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            round: AtomicI64::new(100),
            initialized: AtomicBool::new(true),
            balance: AtomicI64::new(10_000),
            job_reverts: Mutex::new(Vec::new()),
            jobs_created: AtomicI64::new(0),
            advance_round_on_wait: true,
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn account_address(&self) -> String {
        "0xself".to_string()
    }

    async fn token_balance(&self) -> Result<i64> {
        Ok(self.balance.load(Ordering::SeqCst))
    }

    async fn current_round(&self) -> Result<i64> {
        // Rounds advance while something is waiting on them.
        if self.advance_round_on_wait {
            Ok(self.round.fetch_add(1, Ordering::SeqCst))
        } else {
            Ok(self.round.load(Ordering::SeqCst))
        }
    }

    async fn last_initialized_round(&self) -> Result<i64> {
        Ok(self.round.load(Ordering::SeqCst))
    }

    async fn current_round_initialized(&self) -> Result<bool> {
        Ok(self.initialized.load(Ordering::SeqCst))
    }

    async fn initialize_round(&self) -> Result<PendingTx> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(PendingTx {
            hash: TxHash("0xinit".into()),
            gas_limit: 100,
        })
    }

    async fn create_job(&self, _stream_id: &str, _profile: &str, _price: i64) -> Result<PendingTx> {
        self.jobs_created.fetch_add(1, Ordering::SeqCst);
        let revert = {
            let mut reverts = self.job_reverts.lock();
            if reverts.is_empty() {
                false
            } else {
                reverts.remove(0)
            }
        };
        Ok(PendingTx {
            hash: TxHash(if revert { "0xrevert".into() } else { "0xjob".into() }),
            gas_limit: 100,
        })
    }

    async fn register_transcoder(&self, _fee: u8, _reward: u8, _price: i64) -> Result<PendingTx> {
        Ok(PendingTx {
            hash: TxHash("0xreg".into()),
            gas_limit: 100,
        })
    }

    async fn bond(&self, _amount: i64, _to: &str) -> Result<PendingTx> {
        Ok(PendingTx {
            hash: TxHash("0xbond".into()),
            gas_limit: 100,
        })
    }

    async fn transcoder_pool(&self) -> Result<Vec<ChainTranscoder>> {
        Ok(vec![])
    }

    async fn is_active_transcoder(&self) -> Result<bool> {
        Ok(false)
    }

    async fn transcoder_stake(&self) -> Result<i64> {
        Ok(100)
    }

    async fn wait_for_receipt(&self, tx: &TxHash, _timeout: Duration) -> Result<TxReceipt> {
        // A "revert" burns the whole gas limit.
        Ok(TxReceipt {
            gas_used: if tx.0 == "0xrevert" { 100 } else { 42 },
        })
    }
}
