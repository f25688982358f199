#![forbid(unsafe_code)]

mod client;
mod key;
mod service;

pub use client::UpstreamClient;
pub use key::CacheKey;
pub use service::{AggTradesQuery, MarketService, now_millis};
