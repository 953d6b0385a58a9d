//! Orchestrator pool cache: a rolling, database-backed view of the
//! orchestrators this broadcaster is willing to dispatch to.
//!
//! The backing store is a transactional `orchestrators` table keyed by
//! ethereum address. A background task refreshes advertised prices by
//! fanning out info RPCs with a shared deadline; reads always observe a
//! consistent snapshot through the store's transactions.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, ChainTranscoder};
use crate::config;
use crate::error::{normalize_discovery_code, Error, Result};

/// Price fixed-point scale: wei per pixel times 1000.
const PRICE_FIXED_SCALE: i64 = 1000;

/// One cached orchestrator record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbOrch {
    pub service_uri: String,
    pub ethereum_addr: String,
    pub activation_round: i64,
    pub deactivation_round: i64,
    pub price_per_pixel: i64,
}

/// Record filter: active in `current_round` and at or below `max_price`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DbOrchFilter {
    pub max_price: Option<i64>,
    pub current_round: Option<i64>,
}

/// Ticket parameters advertised by an orchestrator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TicketParams {
    pub recipient: String,
    pub face_value: String,
    pub win_prob: String,
    pub recipient_rand_hash: String,
    pub seed: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PriceInfo {
    pub price_per_unit: i64,
    pub pixels_per_unit: i64,
}

/// Broadcaster-side view of one orchestrator's advertised terms.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorInfo {
    pub transcoder: String,
    #[serde(default)]
    pub ticket_params: Option<TicketParams>,
    #[serde(default)]
    pub price_info: Option<PriceInfo>,
}

/// Validates advertised ticket parameters before dispatching to an
/// orchestrator. Implemented by the payment sender.
pub trait TicketParamsValidator: Send + Sync {
    fn validate_ticket_params(&self, params: &TicketParams) -> Result<()>;
}

/// Fetches an orchestrator's advertised info. The HTTP implementation is the
/// production path; tests script their own.
#[async_trait::async_trait]
pub trait OrchInfoClient: Send + Sync {
    async fn get_orch_info(&self, uri: &str) -> Result<OrchestratorInfo>;
}

pub struct HttpOrchInfoClient {
    client: reqwest::Client,
}

impl HttpOrchInfoClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpOrchInfoClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl OrchInfoClient for HttpOrchInfoClient {
    async fn get_orch_info(&self, uri: &str) -> Result<OrchestratorInfo> {
        let url = format!("{}/orchestratorInfo", uri.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Discovery {
                code: normalize_discovery_code(&e.to_string()),
            })?;
        resp.json::<OrchestratorInfo>()
            .await
            .map_err(|e| Error::Discovery {
                code: normalize_discovery_code(&e.to_string()),
            })
    }
}

/// Convert a price rational to the fixed-point representation stored in the
/// cache. Returns `None` for a zero denominator.
pub fn price_to_fixed(price_per_unit: i64, pixels_per_unit: i64) -> Option<i64> {
    if pixels_per_unit == 0 {
        return None;
    }
    Some(price_per_unit.saturating_mul(PRICE_FIXED_SCALE) / pixels_per_unit)
}

/// Prefix bare authorities so they parse as URIs.
pub fn parse_uri(addr: &str) -> String {
    if addr.starts_with("http") {
        addr.to_string()
    } else {
        format!("https://{addr}")
    }
}

fn chain_orch_to_db_orch(orch: &ChainTranscoder) -> DbOrch {
    DbOrch {
        service_uri: orch.service_uri.clone(),
        ethereum_addr: orch.address.clone(),
        // An orchestrator with no recorded window counts as always active
        // until the chain says otherwise.
        activation_round: orch.activation_round.unwrap_or(0),
        deactivation_round: orch.deactivation_round.unwrap_or(i64::MAX),
        price_per_pixel: 0,
    }
}

/// Transactional key-value table of orchestrator records.
#[derive(Clone)]
pub struct OrchestratorStore {
    pool: SqlitePool,
}

impl OrchestratorStore {
    pub async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS orchestrators (
                ethereum_addr      TEXT PRIMARY KEY,
                service_uri        TEXT NOT NULL,
                activation_round   INTEGER NOT NULL,
                deactivation_round INTEGER NOT NULL,
                price_per_pixel    INTEGER NOT NULL DEFAULT 0
            )
            ",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Upsert by ethereum address inside one transaction. A zero incoming
    /// price keeps the previously polled price.
    pub async fn update_orch(&self, orch: &DbOrch) -> Result<()> {
        self.update_orchs(std::slice::from_ref(orch)).await
    }

    /// Upsert a whole refresh cycle in one transaction, so a concurrent read
    /// sees either the previous cycle or this one, never a mix.
    pub async fn update_orchs(&self, orchs: &[DbOrch]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for orch in orchs {
            Self::upsert(&mut tx, orch).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        orch: &DbOrch,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO orchestrators
                (ethereum_addr, service_uri, activation_round, deactivation_round, price_per_pixel)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(ethereum_addr) DO UPDATE SET
                service_uri = excluded.service_uri,
                activation_round = excluded.activation_round,
                deactivation_round = excluded.deactivation_round,
                price_per_pixel = CASE
                    WHEN excluded.price_per_pixel != 0 THEN excluded.price_per_pixel
                    ELSE orchestrators.price_per_pixel
                END
            ",
        )
        .bind(&orch.ethereum_addr)
        .bind(&orch.service_uri)
        .bind(orch.activation_round)
        .bind(orch.deactivation_round)
        .bind(orch.price_per_pixel)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Records matching the filter, cheapest first, earliest activation
    /// breaking ties.
    pub async fn select_orchs(&self, filter: &DbOrchFilter) -> Result<Vec<DbOrch>> {
        let mut sql = String::from(
            "SELECT ethereum_addr, service_uri, activation_round, deactivation_round, \
             price_per_pixel FROM orchestrators WHERE 1 = 1",
        );
        if filter.current_round.is_some() {
            sql.push_str(" AND activation_round <= ? AND deactivation_round > ?");
        }
        if filter.max_price.is_some() {
            sql.push_str(" AND price_per_pixel <= ?");
        }
        sql.push_str(" ORDER BY price_per_pixel ASC, activation_round ASC");

        let mut query = sqlx::query(&sql);
        if let Some(round) = filter.current_round {
            query = query.bind(round).bind(round);
        }
        if let Some(price) = filter.max_price {
            query = query.bind(price);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let orchs = rows
            .into_iter()
            .map(|row| {
                Ok(DbOrch {
                    ethereum_addr: row.try_get("ethereum_addr")?,
                    service_uri: row.try_get("service_uri")?,
                    activation_round: row.try_get("activation_round")?,
                    deactivation_round: row.try_get("deactivation_round")?,
                    price_per_pixel: row.try_get("price_per_pixel")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
        debug!("selected {} orchestrators", orchs.len());
        Ok(orchs)
    }

    pub async fn orch_count(&self, filter: &DbOrchFilter) -> Result<i64> {
        Ok(self.select_orchs(filter).await?.len() as i64)
    }
}

/// The rolling cache of selectable orchestrators.
pub struct DbOrchestratorPoolCache {
    store: OrchestratorStore,
    chain: Arc<dyn ChainClient>,
    validator: Arc<dyn TicketParamsValidator>,
    info_client: Arc<dyn OrchInfoClient>,
    poll_interval: Duration,
    orch_info_timeout: Duration,
}

impl DbOrchestratorPoolCache {
    /// Build the cache: refresh the transcoder set from chain, poll prices
    /// once, then keep polling in the background until cancellation.
    pub async fn new(
        store: OrchestratorStore,
        chain: Arc<dyn ChainClient>,
        validator: Arc<dyn TicketParamsValidator>,
        info_client: Arc<dyn OrchInfoClient>,
        cfg: &config::DiscoveryConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(Self {
            store,
            chain,
            validator,
            info_client,
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            orch_info_timeout: Duration::from_secs(cfg.orch_info_timeout_secs),
        });

        cache.refresh_from_chain().await?;
        cache.cache_db_orchs().await?;

        let poller = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.poll_interval);
            ticker.tick().await; // immediate tick consumed; first poll ran above
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("orchestrator poller stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = poller.cache_db_orchs().await {
                            error!("unable to poll orchestrator info: {}", e);
                        }
                    }
                }
            }
        });

        Ok(cache)
    }

    /// Read the active transcoder set and upsert each record.
    pub async fn refresh_from_chain(&self) -> Result<()> {
        let orchestrators = self
            .chain
            .transcoder_pool()
            .await
            .map_err(|e| Error::Discovery {
                code: normalize_discovery_code(&e.to_string()),
            })?;

        let db_orchs: Vec<DbOrch> = orchestrators.iter().map(chain_orch_to_db_orch).collect();
        if let Err(e) = self.store.update_orchs(&db_orchs).await {
            error!("unable to update orchestrator set: {}", e);
            return Err(e);
        }
        info!("cached {} orchestrators from chain", db_orchs.len());
        Ok(())
    }

    /// Fan out info RPCs (one per cached orchestrator) under one shared
    /// deadline and fold advertised prices back into the store. Individual
    /// failures are logged and skipped.
    pub async fn cache_db_orchs(&self) -> Result<()> {
        let current_round = self.chain.last_initialized_round().await.ok();
        let orchs = self
            .store
            .select_orchs(&DbOrchFilter {
                max_price: None,
                current_round,
            })
            .await?;

        let mut tasks: JoinSet<Result<DbOrch>> = JoinSet::new();
        for mut orch in orchs {
            let info_client = Arc::clone(&self.info_client);
            let timeout = self.orch_info_timeout;
            tasks.spawn(async move {
                let uri = parse_uri(&orch.service_uri);
                let info = tokio::time::timeout(timeout, info_client.get_orch_info(&uri))
                    .await
                    .map_err(|_| Error::Timeout)??;
                let price = info
                    .price_info
                    .and_then(|p| price_to_fixed(p.price_per_unit, p.pixels_per_unit))
                    .ok_or_else(|| Error::Discovery {
                        code: "InvalidPriceInfo".to_string(),
                    })?;
                orch.price_per_pixel = price;
                Ok(orch)
            });
        }

        let mut refreshed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(orch)) => refreshed.push(orch),
                Ok(Err(e)) => warn!("orchestrator info poll failed: {}", e),
                Err(e) => error!("orchestrator info task panicked: {}", e),
            }
        }
        if let Err(e) = self.store.update_orchs(&refreshed).await {
            error!("error updating orchestrators in store: {}", e);
        }
        Ok(())
    }

    async fn get_uris(&self) -> Result<Vec<String>> {
        let filter = DbOrchFilter {
            max_price: Some(config::broadcast_settings().price),
            current_round: Some(self.chain.last_initialized_round().await?),
        };
        let orchs = self.store.select_orchs(&filter).await?;
        Ok(orchs.into_iter().map(|o| parse_uri(&o.service_uri)).collect())
    }

    pub async fn get_urls(&self) -> Vec<String> {
        self.get_uris().await.unwrap_or_default()
    }

    pub async fn size(&self) -> i64 {
        let Ok(round) = self.chain.last_initialized_round().await else {
            return 0;
        };
        self.store
            .orch_count(&DbOrchFilter {
                max_price: Some(config::broadcast_settings().price),
                current_round: Some(round),
            })
            .await
            .unwrap_or(0)
    }

    /// Select up to `n` orchestrators, query each under a common deadline
    /// and keep those whose ticket parameters validate and whose price is at
    /// or below the broadcaster max.
    pub async fn get_orchestrators(&self, n: usize) -> Result<Vec<OrchestratorInfo>> {
        let uris = self.get_uris().await?;
        if uris.is_empty() {
            return Ok(Vec::new());
        }

        let max_price = config::broadcast_settings().price;
        let mut tasks: JoinSet<Result<OrchestratorInfo>> = JoinSet::new();
        for uri in uris.into_iter().take(n) {
            let info_client = Arc::clone(&self.info_client);
            let timeout = self.orch_info_timeout;
            tasks.spawn(async move {
                tokio::time::timeout(timeout, info_client.get_orch_info(&uri))
                    .await
                    .map_err(|_| Error::Timeout)?
            });
        }

        let mut infos = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let info = match joined {
                Ok(Ok(info)) => info,
                Ok(Err(e)) => {
                    warn!("orchestrator query failed: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("orchestrator query task panicked: {}", e);
                    continue;
                }
            };

            let params_ok = info
                .ticket_params
                .as_ref()
                .is_some_and(|p| self.validator.validate_ticket_params(p).is_ok());
            let price_ok = info
                .price_info
                .and_then(|p| price_to_fixed(p.price_per_unit, p.pixels_per_unit))
                .is_some_and(|price| price <= max_price);
            if params_ok && price_ok {
                infos.push(info);
            }
        }
        Ok(infos)
    }
}

/// Accepts every ticket parameter set. Stands in until a payment sender is
/// wired up.
pub struct AcceptAllTickets;

impl TicketParamsValidator for AcceptAllTickets {
    fn validate_ticket_params(&self, _params: &TicketParams) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    async fn store() -> OrchestratorStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        OrchestratorStore::init(pool).await.unwrap()
    }

    fn orch(addr: &str, activation: i64, deactivation: i64, price: i64) -> DbOrch {
        DbOrch {
            service_uri: format!("{addr}.example.com:8935"),
            ethereum_addr: addr.to_string(),
            activation_round: activation,
            deactivation_round: deactivation,
            price_per_pixel: price,
        }
    }

    #[tokio::test]
    async fn test_select_filter_round_and_price() {
        let store = store().await;
        store.update_orch(&orch("0xa", 0, 100, 10)).await.unwrap();
        store.update_orch(&orch("0xb", 0, 5, 10)).await.unwrap(); // deactivated
        store.update_orch(&orch("0xc", 50, 100, 10)).await.unwrap(); // not yet active
        store.update_orch(&orch("0xd", 0, 100, 99)).await.unwrap(); // too expensive

        let filter = DbOrchFilter {
            max_price: Some(20),
            current_round: Some(10),
        };
        let got = store.select_orchs(&filter).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].ethereum_addr, "0xa");

        for r in &got {
            assert!(r.activation_round <= 10 && 10 < r.deactivation_round);
            assert!(r.price_per_pixel <= 20);
        }
    }

    #[tokio::test]
    async fn test_select_orders_by_price_then_activation() {
        let store = store().await;
        store.update_orch(&orch("0xa", 5, 100, 20)).await.unwrap();
        store.update_orch(&orch("0xb", 1, 100, 10)).await.unwrap();
        store.update_orch(&orch("0xc", 0, 100, 10)).await.unwrap();

        let got = store
            .select_orchs(&DbOrchFilter {
                max_price: None,
                current_round: Some(50),
            })
            .await
            .unwrap();
        let addrs: Vec<&str> = got.iter().map(|o| o.ethereum_addr.as_str()).collect();
        assert_eq!(addrs, vec!["0xc", "0xb", "0xa"]);
    }

    #[tokio::test]
    async fn test_upsert_keeps_price_on_chain_refresh() {
        let store = store().await;
        store.update_orch(&orch("0xa", 0, 100, 42)).await.unwrap();
        // Chain refresh carries no price.
        store.update_orch(&orch("0xa", 0, 200, 0)).await.unwrap();

        let got = store.select_orchs(&DbOrchFilter::default()).await.unwrap();
        assert_eq!(got[0].price_per_pixel, 42);
        assert_eq!(got[0].deactivation_round, 200);
    }

    #[test]
    fn test_absent_rounds_default_to_open_window() {
        let db = chain_orch_to_db_orch(&ChainTranscoder {
            service_uri: "orch.example.com".into(),
            address: "0xa".into(),
            activation_round: None,
            deactivation_round: None,
        });
        assert_eq!(db.activation_round, 0);
        assert_eq!(db.deactivation_round, i64::MAX);
    }

    #[test]
    fn test_price_to_fixed() {
        assert_eq!(price_to_fixed(1, 1), Some(1000));
        assert_eq!(price_to_fixed(5, 2), Some(2500));
        assert_eq!(price_to_fixed(1, 0), None);
    }

    #[test]
    fn test_parse_uri_prefixes_scheme() {
        assert_eq!(parse_uri("orch.example.com:8935"), "https://orch.example.com:8935");
        assert_eq!(parse_uri("http://orch.example.com"), "http://orch.example.com");
    }

    struct ScriptedInfoClient {
        responses: Mutex<HashMap<String, OrchestratorInfo>>,
    }

    #[async_trait::async_trait]
    impl OrchInfoClient for ScriptedInfoClient {
        async fn get_orch_info(&self, uri: &str) -> Result<OrchestratorInfo> {
            self.responses
                .lock()
                .get(uri)
                .cloned()
                .ok_or(Error::Discovery {
                    code: "Unreachable".to_string(),
                })
        }
    }

    struct PoolChain;

    #[async_trait::async_trait]
    impl ChainClient for PoolChain {
        fn account_address(&self) -> String {
            "0xself".into()
        }
        async fn token_balance(&self) -> Result<i64> {
            Ok(0)
        }
        async fn current_round(&self) -> Result<i64> {
            Ok(10)
        }
        async fn last_initialized_round(&self) -> Result<i64> {
            Ok(10)
        }
        async fn current_round_initialized(&self) -> Result<bool> {
            Ok(true)
        }
        async fn initialize_round(&self) -> Result<crate::chain::PendingTx> {
            unimplemented!()
        }
        async fn create_job(&self, _: &str, _: &str, _: i64) -> Result<crate::chain::PendingTx> {
            unimplemented!()
        }
        async fn register_transcoder(&self, _: u8, _: u8, _: i64) -> Result<crate::chain::PendingTx> {
            unimplemented!()
        }
        async fn bond(&self, _: i64, _: &str) -> Result<crate::chain::PendingTx> {
            unimplemented!()
        }
        async fn transcoder_pool(&self) -> Result<Vec<ChainTranscoder>> {
            Ok(vec![
                ChainTranscoder {
                    service_uri: "cheap.example.com".into(),
                    address: "0xcheap".into(),
                    activation_round: Some(0),
                    deactivation_round: Some(100),
                },
                ChainTranscoder {
                    service_uri: "pricey.example.com".into(),
                    address: "0xpricey".into(),
                    activation_round: Some(0),
                    deactivation_round: Some(100),
                },
            ])
        }
        async fn is_active_transcoder(&self) -> Result<bool> {
            Ok(false)
        }
        async fn transcoder_stake(&self) -> Result<i64> {
            Ok(0)
        }
        async fn wait_for_receipt(
            &self,
            _: &crate::chain::TxHash,
            _: Duration,
        ) -> Result<crate::chain::TxReceipt> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_pool_cache_polls_prices_and_filters() {
        let mut responses = HashMap::new();
        responses.insert(
            "https://cheap.example.com".to_string(),
            OrchestratorInfo {
                transcoder: "https://cheap.example.com".into(),
                ticket_params: Some(TicketParams::default()),
                price_info: Some(PriceInfo {
                    price_per_unit: 1,
                    pixels_per_unit: 100,
                }),
            },
        );
        responses.insert(
            "https://pricey.example.com".to_string(),
            OrchestratorInfo {
                transcoder: "https://pricey.example.com".into(),
                ticket_params: Some(TicketParams::default()),
                price_info: Some(PriceInfo {
                    price_per_unit: 1_000_000,
                    pixels_per_unit: 1,
                }),
            },
        );

        let cancel = CancellationToken::new();
        let cache = DbOrchestratorPoolCache::new(
            store().await,
            Arc::new(PoolChain),
            Arc::new(AcceptAllTickets),
            Arc::new(ScriptedInfoClient {
                responses: Mutex::new(responses),
            }),
            &config::DiscoveryConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();

        // The pricey orchestrator exceeds the broadcaster max price.
        let infos = cache.get_orchestrators(10).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].transcoder, "https://cheap.example.com");

        cancel.cancel();
    }
}
