use reqwest::Url;
use serde_json::Value;
use tokio::time::Duration;
use tracing::debug;

use marketcache_common::UpstreamError;

/// Cliente HTTP da API upstream de dados de mercado.
///
/// Toda requisição tem timeout. Não faz retry: quem chama decide.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Request {
                url: base_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Monta a URL completa preservando a ordem dos parâmetros.
    pub fn url_for(&self, path: &str, params: &[(&str, String)]) -> Result<Url, UpstreamError> {
        let raw = format!("{}{path}", self.base_url);
        let mut url = Url::parse(&raw).map_err(|e| UpstreamError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (name, value) in params {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }

    /// GET em `path` e decodifica o corpo como JSON.
    pub async fn get_json(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, UpstreamError> {
        let url = self.url_for(path, params)?;
        let url_str = url.to_string();
        debug!("GET {url_str}");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| UpstreamError::Request {
                url: url_str.clone(),
                reason: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                url: url_str,
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::Decode {
                url: url_str,
                reason: e.without_url().to_string(),
            })
    }
}
