use std::time::Duration;

use clap::Parser;

use marketcache_common::{
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_UPSTREAM_URL, MAX_CONCURRENT_REFRESHES,
};
use marketcache_storage::CachePolicy;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "marketcache-server",
    about = "marketcache: cache stale-while-revalidate na frente de uma API de dados de mercado"
)]
pub struct Args {
    #[arg(long, env = "MARKETCACHE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,
    #[arg(long, env = "MARKETCACHE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[arg(long, env = "MARKETCACHE_UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: String,
    /// TTL dos dados em cache (ex.: 60s, 1m).
    #[arg(
        long,
        env = "MARKETCACHE_CACHE_TTL",
        default_value = "60s",
        value_parser = parse_duration,
    )]
    pub cache_ttl: Duration,
    /// Janela mínima entre refreshes da mesma chave.
    #[arg(
        long,
        env = "MARKETCACHE_REFRESH_DELAY",
        default_value = "500ms",
        value_parser = parse_duration,
    )]
    pub refresh_delay: Duration,
    #[arg(
        long,
        env = "MARKETCACHE_SWEEP_INTERVAL",
        default_value = "10m",
        value_parser = parse_duration,
    )]
    pub sweep_interval: Duration,
    #[arg(
        long,
        env = "MARKETCACHE_FETCH_TIMEOUT",
        default_value = "10s",
        value_parser = parse_duration,
    )]
    pub fetch_timeout: Duration,
    #[arg(long, env = "MARKETCACHE_MAX_REFRESHES", default_value_t = MAX_CONCURRENT_REFRESHES)]
    pub max_refreshes: usize,
    /// Quanto esperar pelos refreshes em andamento no shutdown.
    #[arg(
        long,
        env = "MARKETCACHE_SHUTDOWN_GRACE",
        default_value = "5s",
        value_parser = parse_duration,
    )]
    pub shutdown_grace: Duration,
}

impl Args {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A guarda de refresh precisa expirar antes dos dados.
    pub fn cache_policy(&self) -> anyhow::Result<CachePolicy> {
        anyhow::ensure!(
            self.refresh_delay < self.cache_ttl,
            "refresh-delay ({:?}) precisa ser menor que cache-ttl ({:?})",
            self.refresh_delay,
            self.cache_ttl
        );
        Ok(CachePolicy::new(self.cache_ttl, self.refresh_delay))
    }
}

/// Aceita `500ms`, `30s`, `10m`, `1h` ou um número puro em milissegundos.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let n: u64 = digits
        .parse()
        .map_err(|_| format!("duração inválida: '{s}'"))?;

    match unit {
        "" | "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("unidade inválida em '{s}'. Use: ms, s, m, h")),
    }
}
