use serde_json::{Value, json};

use marketcache_common::MarketResult;
use marketcache_storage::{CachePolicy, RefreshCache};

use crate::client::UpstreamClient;
use crate::key::CacheKey;

/// Prefixo dos nomes de cache das operações spot.
const CACHE_PREFIX: &str = "spot_";

/// Parâmetros de `/api/v3/aggTrades`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggTradesQuery {
    pub symbol: String,
    pub from_id: Option<i64>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: u32,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Operações de dados de mercado, todas servidas pelo `RefreshCache`.
#[derive(Clone)]
pub struct MarketService {
    cache: RefreshCache<Value>,
    client: UpstreamClient,
    policy: CachePolicy,
}

impl MarketService {
    pub fn new(cache: RefreshCache<Value>, client: UpstreamClient, policy: CachePolicy) -> Self {
        Self {
            cache,
            client,
            policy,
        }
    }

    pub fn cache(&self) -> &RefreshCache<Value> {
        &self.cache
    }

    async fn cached(
        &self,
        cache_name: &str,
        key: CacheKey,
        path: &'static str,
        params: Vec<(&'static str, String)>,
    ) -> MarketResult<Value> {
        let client = self.client.clone();
        let fetch = move || async move { client.get_json(path, &params).await };
        self.cache
            .get_or_fetch(
                &format!("{CACHE_PREFIX}{cache_name}"),
                &key.build(),
                fetch,
                self.policy,
            )
            .await
    }

    // --- General ---

    pub fn ping(&self) -> Value {
        json!({
            "serverTime": now_millis(),
            "message": "success",
        })
    }

    pub fn server_time(&self) -> Value {
        json!({ "serverTime": now_millis() })
    }

    pub async fn exchange_info(&self) -> MarketResult<Value> {
        self.cached("exchangeinfo", CacheKey::new(), "/api/v3/exchangeInfo", vec![])
            .await
    }

    // --- Market data ---

    pub async fn ticker_price(&self, symbol: &str) -> MarketResult<Value> {
        self.cached(
            "tickerprice",
            CacheKey::new().part(symbol),
            "/api/v3/ticker/price",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }

    pub async fn all_ticker_prices(&self) -> MarketResult<Value> {
        self.cached("alltickerprices", CacheKey::new(), "/api/v3/ticker/price", vec![])
            .await
    }

    pub async fn book_ticker(&self, symbol: &str) -> MarketResult<Value> {
        self.cached(
            "bookticker",
            CacheKey::new().part(symbol),
            "/api/v3/ticker/bookTicker",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }

    pub async fn all_book_tickers(&self) -> MarketResult<Value> {
        self.cached(
            "allbooktickers",
            CacheKey::new(),
            "/api/v3/ticker/bookTicker",
            vec![],
        )
        .await
    }

    pub async fn depth(&self, symbol: &str, limit: u32) -> MarketResult<Value> {
        self.cached(
            "depth",
            CacheKey::new().part(symbol).part(limit),
            "/api/v3/depth",
            vec![("symbol", symbol.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    pub async fn recent_trades(&self, symbol: &str, limit: u32) -> MarketResult<Value> {
        self.cached(
            "recenttrades",
            CacheKey::new().part(symbol).part(limit),
            "/api/v3/trades",
            vec![("symbol", symbol.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    pub async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> MarketResult<Value> {
        self.cached(
            "klines",
            CacheKey::new().part(symbol).part(interval).part(limit),
            "/api/v3/klines",
            vec![
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    pub async fn historical_trades(
        &self,
        symbol: &str,
        limit: u32,
        from_id: Option<i64>,
    ) -> MarketResult<Value> {
        let mut params = vec![("symbol", symbol.to_string()), ("limit", limit.to_string())];
        if let Some(id) = from_id {
            params.push(("fromId", id.to_string()));
        }
        self.cached(
            "historicaltrades",
            CacheKey::new().part(symbol).part(limit).tagged('f', from_id),
            "/api/v3/historicalTrades",
            params,
        )
        .await
    }

    pub async fn aggregate_trades(&self, query: &AggTradesQuery) -> MarketResult<Value> {
        let mut params = vec![("symbol", query.symbol.clone())];
        if let Some(id) = query.from_id {
            params.push(("fromId", id.to_string()));
        }
        if let Some(t) = query.start_time {
            params.push(("startTime", t.to_string()));
        }
        if let Some(t) = query.end_time {
            params.push(("endTime", t.to_string()));
        }
        params.push(("limit", query.limit.to_string()));

        let key = CacheKey::new()
            .part(&query.symbol)
            .part(query.limit)
            .tagged('f', query.from_id)
            .tagged('s', query.start_time)
            .tagged('e', query.end_time);
        self.cached("aggregatetrades", key, "/api/v3/aggTrades", params)
            .await
    }

    pub async fn avg_price(&self, symbol: &str) -> MarketResult<Value> {
        self.cached(
            "avgprice",
            CacheKey::new().part(symbol),
            "/api/v3/avgPrice",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }

    pub async fn ticker_24hr(&self, symbol: &str) -> MarketResult<Value> {
        self.cached(
            "ticker24hr",
            CacheKey::new().part(symbol),
            "/api/v3/ticker/24hr",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }
}
