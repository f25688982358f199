use std::time::Duration;

/// Erros da API upstream de dados de mercado.
///
/// Toda variante carrega a URL completa da requisição que falhou.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("URL inválida {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("erro ao buscar dados de {url}: {reason}")]
    Request { url: String, reason: String },
    #[error("status {status} recebido de {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("erro ao decodificar resposta de {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl UpstreamError {
    pub fn url(&self) -> &str {
        match self {
            UpstreamError::InvalidUrl { url, .. }
            | UpstreamError::Request { url, .. }
            | UpstreamError::Status { url, .. }
            | UpstreamError::Decode { url, .. } => url,
        }
    }
}

/// Erros do caminho síncrono (cache miss) do `get_or_fetch`.
///
/// `E` é o erro da função de fetch, repassado sem alteração.
#[derive(Debug, thiserror::Error)]
pub enum CacheError<E>
where
    E: std::error::Error + 'static,
{
    #[error("falha ao buscar '{key}': {source}")]
    Fetch {
        key: String,
        #[source]
        source: E,
    },
    #[error("fetch de '{key}' excedeu o timeout de {timeout:?}")]
    Timeout { key: String, timeout: Duration },
}

impl<E> CacheError<E>
where
    E: std::error::Error + 'static,
{
    /// Chave lógica da operação que falhou.
    pub fn key(&self) -> &str {
        match self {
            CacheError::Fetch { key, .. } | CacheError::Timeout { key, .. } => key,
        }
    }

    /// Erro original do fetch, se houver (timeouts não têm).
    pub fn upstream(&self) -> Option<&E> {
        match self {
            CacheError::Fetch { source, .. } => Some(source),
            CacheError::Timeout { .. } => None,
        }
    }
}

/// Result type alias para operações de mercado.
pub type MarketResult<T> = Result<T, CacheError<UpstreamError>>;
