use tokio::time::Instant;

/// Valor guardado pelo `RefreshCache` no store compartilhado.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<V> {
    /// Resposta upstream em cache.
    Value(V),
    /// Marcador `<chave>:delay`: um refresh começou há pouco. Carrega o id
    /// de quem reivindicou, para que só o dono possa liberá-lo.
    RefreshGuard(u64),
}

impl<V> Cached<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Cached::Value(v) => Some(v),
            Cached::RefreshGuard(_) => None,
        }
    }
}

/// Entrada no store: valor + instante absoluto de expiração.
#[derive(Debug, Clone)]
pub(crate) struct Entry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> Entry<V> {
    pub fn new(value: V, expires_at: Instant) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// O próprio instante `expires_at` já conta como expirado.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}
