use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::entry::Entry;

/// Estado compartilhado entre todos os handles do store.
struct SharedState<V> {
    data: DashMap<String, Entry<V>>,
}

/// Handle para o store in-memory com expiração por entrada.
///
/// Clonar o handle é barato: todos os clones apontam para o mesmo mapa.
/// O mapa é particionado (DashMap), então leitores de chaves diferentes
/// nunca esperam por um escritor.
pub struct Store<V> {
    shared: Arc<SharedState<V>>,
}

impl<V> Clone for Store<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> Store<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Store {
            shared: Arc::new(SharedState {
                data: DashMap::new(),
            }),
        }
    }

    /// Grava `value` com `expires_at = agora + ttl`, sobrescrevendo a entrada anterior.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry::new(value, Instant::now() + ttl);
        self.shared.data.insert(key.into(), entry);
    }

    /// Grava apenas se a chave não existir ou já tiver expirado.
    ///
    /// A verificação e a escrita acontecem sob o lock do shard da chave,
    /// então entre vários chamadores concorrentes exatamente um vence.
    pub fn set_nx(&self, key: impl Into<String>, value: V, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.shared.data.entry(key.into()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_expired_at(now) {
                    return false;
                }
                occupied.insert(Entry::new(value, now + ttl));
                true
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, now + ttl));
                true
            }
        }
    }

    /// Lê a chave. Entradas expiradas são removidas na própria leitura.
    pub fn get(&self, key: &str) -> Option<V> {
        {
            let entry = self.shared.data.get(key)?;
            if !entry.is_expired() {
                return Some(entry.value.clone());
            }
        }
        // Só remove se ainda estiver expirada (pode ter sido re-setada)
        if self
            .shared
            .data
            .remove_if(key, |_, e| e.is_expired())
            .is_some()
        {
            debug!("chave expirada removida na leitura: {key}");
        }
        None
    }

    /// Remove a chave; no-op se ausente.
    pub fn delete(&self, key: &str) {
        self.shared.data.remove(key);
    }

    /// Remove a chave só se o valor atual satisfizer `pred`. Verificação e
    /// remoção acontecem sob o mesmo lock de shard.
    pub fn delete_if(&self, key: &str, pred: impl FnOnce(&V) -> bool) -> bool {
        self.shared
            .data
            .remove_if(key, |_, entry| pred(&entry.value))
            .is_some()
    }

    /// Equivale a `get` descartando o valor. Não é atômico junto com um `get` posterior.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Número bruto de entradas, incluindo expiradas ainda não recolhidas.
    pub fn len(&self) -> usize {
        self.shared.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.data.is_empty()
    }

    /// Uma passada de varredura: remove toda entrada expirada e retorna quantas.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.shared.data.retain(|key, entry| {
            if entry.is_expired_at(now) {
                debug!("key expirada removida: {key}");
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Inicia a varredura periódica no runtime tokio atual.
    ///
    /// O intervalo é independente do TTL de qualquer entrada, então um único
    /// store atende vários caches lógicos com TTLs diferentes.
    pub fn spawn_sweeper(&self, every: Duration) -> Sweeper {
        let every = every.max(Duration::from_millis(1));
        let shutdown = Arc::new(Notify::new());

        let store = self.clone();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            sweep_expired_keys(store, every, signal).await;
        });

        info!("sweeper iniciado (intervalo {every:?})");
        Sweeper { shutdown, handle }
    }
}

impl<V> Default for Store<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Handle da task de varredura. `stop` encerra a task e espera ela terminar.
///
/// Dropar o handle também sinaliza o encerramento, sem esperar.
pub struct Sweeper {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Err(e) = (&mut self.handle).await {
            warn!("sweeper terminou com erro: {e}");
        }
        info!("sweeper parado");
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Background task que varre chaves expiradas a cada `every`.
async fn sweep_expired_keys<V>(store: Store<V>, every: Duration, shutdown: Arc<Notify>)
where
    V: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!("varredura removeu {removed} chaves expiradas");
                }
            }
            _ = shutdown.notified() => {
                return;
            }
        }
    }
}
