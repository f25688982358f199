use std::collections::HashMap;
use std::str::FromStr;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use marketcache_market::{AggTradesQuery, MarketService, now_millis};

use crate::error::{ApiError, ApiResult};
use crate::response::MessageId;

pub const API_SYSTEM_TIME: &str = "/api/v1/system/time";

pub const API_PING: &str = "/api/v1/crypto/ping";
pub const API_SERVER_TIME: &str = "/api/v1/crypto/time";
pub const API_EXCHANGE_INFO: &str = "/api/v1/crypto/exchangeInfo";
pub const API_TICKER_PRICE: &str = "/api/v1/crypto/ticker/price";
pub const API_ALL_PRICES: &str = "/api/v1/crypto/ticker/allPrices";
pub const API_BOOK_TICKER: &str = "/api/v1/crypto/bookTicker";
pub const API_DEPTH: &str = "/api/v1/crypto/depth";
pub const API_RECENT_TRADES: &str = "/api/v1/crypto/trades";
pub const API_KLINES: &str = "/api/v1/crypto/klines";
pub const API_HISTORICAL_TRADES: &str = "/api/v1/crypto/historicalTrades";
pub const API_AGGREGATE_TRADES: &str = "/api/v1/crypto/aggregateTrades";
pub const API_AVG_PRICE: &str = "/api/v1/crypto/avgPrice";
pub const API_TICKER_24HR: &str = "/api/v1/crypto/ticker/24hr";
pub const API_ALL_BOOK_TICKERS: &str = "/api/v1/crypto/bookTicker/all";

const DEFAULT_LIMIT: u32 = 10;
const DEFAULT_TRADES_LIMIT: u32 = 500;

/// Monta o router HTTP com CORS e tracing por requisição.
pub fn router(market: MarketService) -> Router {
    Router::new()
        .route(API_SYSTEM_TIME, get(system_time))
        .route(API_PING, get(ping))
        .route(API_SERVER_TIME, get(server_time))
        .route(API_EXCHANGE_INFO, get(exchange_info))
        .route(API_TICKER_PRICE, get(ticker_price))
        .route(API_ALL_PRICES, get(all_prices))
        .route(API_BOOK_TICKER, get(book_ticker))
        .route(API_DEPTH, get(depth))
        .route(API_RECENT_TRADES, get(recent_trades))
        .route(API_KLINES, get(klines))
        .route(API_HISTORICAL_TRADES, get(historical_trades))
        .route(API_AGGREGATE_TRADES, get(aggregate_trades))
        .route(API_AVG_PRICE, get(avg_price))
        .route(API_TICKER_24HR, get(ticker_24hr))
        .route(API_ALL_BOOK_TICKERS, get(all_book_tickers))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(market)
}

/// Query string crua; a validação fica em cada handler.
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct Params(HashMap<String, String>);

impl Params {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<&str, ApiError> {
        self.get(name).ok_or(ApiError::MissingParam(name))
    }

    fn optional<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ApiError> {
        self.get(name)
            .map(|v| v.parse().map_err(|_| ApiError::InvalidParam(name)))
            .transpose()
    }

    fn or_default<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ApiError> {
        Ok(self.optional(name)?.unwrap_or(default))
    }
}

// --- System ---

async fn system_time(id: MessageId) -> Response {
    id.reply(Ok(json!({ "serverTime": now_millis() })))
}

async fn not_found(id: MessageId) -> Response {
    id.respond(StatusCode::NOT_FOUND, None)
}

// --- General ---

async fn ping(State(market): State<MarketService>, id: MessageId) -> Response {
    id.reply(Ok(market.ping()))
}

async fn server_time(State(market): State<MarketService>, id: MessageId) -> Response {
    id.reply(Ok(market.server_time()))
}

async fn exchange_info(State(market): State<MarketService>, id: MessageId) -> Response {
    id.reply(market.exchange_info().await.map_err(ApiError::from))
}

// --- Market data ---

async fn ticker_price(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let symbol = params.required("symbol")?;
        Ok::<_, ApiError>(market.ticker_price(symbol).await?)
    }
    .await;
    id.reply(result)
}

async fn all_prices(State(market): State<MarketService>, id: MessageId) -> Response {
    id.reply(market.all_ticker_prices().await.map_err(ApiError::from))
}

async fn book_ticker(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let symbol = params.required("symbol")?;
        Ok::<_, ApiError>(market.book_ticker(symbol).await?)
    }
    .await;
    id.reply(result)
}

async fn all_book_tickers(State(market): State<MarketService>, id: MessageId) -> Response {
    id.reply(market.all_book_tickers().await.map_err(ApiError::from))
}

async fn depth(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let symbol = params.required("symbol")?;
        let limit = params.or_default("limit", DEFAULT_LIMIT)?;
        Ok::<_, ApiError>(market.depth(symbol, limit).await?)
    }
    .await;
    id.reply(result)
}

async fn recent_trades(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let symbol = params.required("symbol")?;
        let limit = params.or_default("limit", DEFAULT_LIMIT)?;
        Ok::<_, ApiError>(market.recent_trades(symbol, limit).await?)
    }
    .await;
    id.reply(result)
}

async fn klines(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let symbol = params.required("symbol")?;
        let interval = params.required("interval")?;
        let limit = params.or_default("limit", DEFAULT_LIMIT)?;
        Ok::<_, ApiError>(market.klines(symbol, interval, limit).await?)
    }
    .await;
    id.reply(result)
}

async fn historical_trades(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let symbol = params.required("symbol")?;
        let limit = params.or_default("limit", DEFAULT_TRADES_LIMIT)?;
        let from_id = params.optional("fromId")?;
        Ok::<_, ApiError>(market.historical_trades(symbol, limit, from_id).await?)
    }
    .await;
    id.reply(result)
}

async fn aggregate_trades(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let query = AggTradesQuery {
            symbol: params.required("symbol")?.to_string(),
            from_id: params.optional("fromId")?,
            start_time: params.optional("startTime")?,
            end_time: params.optional("endTime")?,
            limit: params.or_default("limit", DEFAULT_TRADES_LIMIT)?,
        };
        Ok::<_, ApiError>(market.aggregate_trades(&query).await?)
    }
    .await;
    id.reply(result)
}

async fn avg_price(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let symbol = params.required("symbol")?;
        Ok::<_, ApiError>(market.avg_price(symbol).await?)
    }
    .await;
    id.reply(result)
}

async fn ticker_24hr(
    State(market): State<MarketService>,
    id: MessageId,
    Query(params): Query<Params>,
) -> Response {
    let result: ApiResult = async {
        let symbol = params.required("symbol")?;
        Ok::<_, ApiError>(market.ticker_24hr(symbol).await?)
    }
    .await;
    id.reply(result)
}
