use std::fmt::Display;

use marketcache_common::GLOBAL_KEY_SUFFIX;

/// Construtor do sufixo canônico de chave de cache.
///
/// Partes obrigatórias são unidas por `-`. Parâmetros opcionais só entram
/// quando presentes e levam uma tag de uma letra, então combinações
/// diferentes de opcionais nunca colidem. `-`, `:` e `%` dentro de um valor
/// são escapados.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKey {
    parts: Vec<String>,
}

impl CacheKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn part(mut self, value: impl Display) -> Self {
        self.parts.push(escape(&value.to_string()));
        self
    }

    pub fn tagged(mut self, tag: char, value: Option<impl Display>) -> Self {
        if let Some(v) = value {
            self.parts.push(format!("{tag}{}", escape(&v.to_string())));
        }
        self
    }

    pub fn build(self) -> String {
        if self.parts.is_empty() {
            return GLOBAL_KEY_SUFFIX.to_string();
        }
        self.parts.join("-")
    }
}

fn escape(raw: &str) -> String {
    raw.replace('%', "%25")
        .replace('-', "%2D")
        .replace(':', "%3A")
}
