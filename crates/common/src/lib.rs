#![forbid(unsafe_code)]

use std::time::Duration;

mod error;

pub use error::*;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.binance.com";

/// TTL dos valores de mercado em cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
/// Janela mínima entre dois refreshes da mesma chave.
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_millis(500);
/// Intervalo da varredura de chaves expiradas, independente de qualquer TTL.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const MAX_CONCURRENT_REFRESHES: usize = 64;

/// Sufixo das chaves de guarda de refresh.
pub const REFRESH_GUARD_SUFFIX: &str = ":delay";
/// Sufixo usado por operações sem parâmetros.
pub const GLOBAL_KEY_SUFFIX: &str = "global";
