use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::Semaphore;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use marketcache_common::{
    CacheError, DEFAULT_CACHE_TTL, DEFAULT_FETCH_TIMEOUT, DEFAULT_REFRESH_DELAY,
    MAX_CONCURRENT_REFRESHES, REFRESH_GUARD_SUFFIX,
};

use crate::entry::Cached;
use crate::store::Store;

/// TTL dos dados e janela mínima entre refreshes de uma chave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub refresh_delay: Duration,
}

impl CachePolicy {
    pub fn new(ttl: Duration, refresh_delay: Duration) -> Self {
        Self { ttl, refresh_delay }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            refresh_delay: DEFAULT_REFRESH_DELAY,
        }
    }
}

/// Cache stale-while-revalidate sobre um `Store`.
///
/// Num hit o valor em cache volta na hora e um refresh é agendado em
/// background; num miss o fetch roda de forma síncrona e popula o store.
/// A guarda `<chave>:delay` garante no máximo um refresh por chave dentro
/// de cada janela `refresh_delay`, e a marca de refresh em andamento impede
/// um segundo fetch da mesma chave enquanto o primeiro não terminar, mesmo
/// que o upstream demore mais que a janela. A coordenação é por chave:
/// refreshes de chaves diferentes rodam em paralelo, limitados por
/// `max_refreshes`.
pub struct RefreshCache<V> {
    store: Store<Cached<V>>,
    in_flight: Arc<DashMap<String, ()>>,
    next_claim: Arc<AtomicU64>,
    fetch_timeout: Duration,
    refresh_permits: Arc<Semaphore>,
    max_refreshes: u32,
}

impl<V> Clone for RefreshCache<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            in_flight: Arc::clone(&self.in_flight),
            next_claim: Arc::clone(&self.next_claim),
            fetch_timeout: self.fetch_timeout,
            refresh_permits: Arc::clone(&self.refresh_permits),
            max_refreshes: self.max_refreshes,
        }
    }
}

impl<V> RefreshCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Store<Cached<V>>) -> Self {
        Self::with_limits(store, DEFAULT_FETCH_TIMEOUT, MAX_CONCURRENT_REFRESHES)
    }

    pub fn with_limits(
        store: Store<Cached<V>>,
        fetch_timeout: Duration,
        max_refreshes: usize,
    ) -> Self {
        let max_refreshes = u32::try_from(max_refreshes.max(1)).unwrap_or(u32::MAX);
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
            next_claim: Arc::new(AtomicU64::new(0)),
            fetch_timeout,
            refresh_permits: Arc::new(Semaphore::new(max_refreshes as usize)),
            max_refreshes,
        }
    }

    pub fn store(&self) -> &Store<Cached<V>> {
        &self.store
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Chave lógica: `<cache_name>:<key_suffix>`.
    ///
    /// `%` e `:` dentro das partes são escapados, então uma chave lógica tem
    /// exatamente um `:` e nunca coincide com a guarda de outra chave.
    pub fn key_for(cache_name: &str, key_suffix: &str) -> String {
        format!("{}:{}", escape_key_part(cache_name), escape_key_part(key_suffix))
    }

    pub fn guard_key(key: &str) -> String {
        format!("{key}{REFRESH_GUARD_SUFFIX}")
    }

    /// Refreshes em background ainda em andamento.
    pub fn refreshes_in_flight(&self) -> usize {
        (self.max_refreshes as usize).saturating_sub(self.refresh_permits.available_permits())
    }

    /// Retorna o valor em cache ou busca no upstream.
    ///
    /// Hit: devolve o valor em cache e agenda um refresh sem esperar por ele.
    /// Miss: chama `fetch`; em sucesso grava o valor e a guarda de refresh,
    /// em falha propaga o erro sem gravar nada.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        cache_name: &str,
        key_suffix: &str,
        fetch: F,
        policy: CachePolicy,
    ) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = Self::key_for(cache_name, key_suffix);

        if let Some(value) = self.lookup(&key) {
            debug!("cache hit: {key}");
            self.spawn_refresh(key, fetch, policy);
            return Ok(value);
        }

        debug!("cache miss: {key}");
        let value = match timeout(self.fetch_timeout, fetch()).await {
            Ok(Ok(value)) => value,
            Ok(Err(source)) => return Err(CacheError::Fetch { key, source }),
            Err(_) => {
                return Err(CacheError::Timeout {
                    key,
                    timeout: self.fetch_timeout,
                });
            }
        };

        let guard_key = Self::guard_key(&key);
        let claim = self.claim_id();
        self.store.set(key, Cached::Value(value.clone()), policy.ttl);
        self.store
            .set(guard_key, Cached::RefreshGuard(claim), policy.refresh_delay);
        Ok(value)
    }

    fn lookup(&self, key: &str) -> Option<V> {
        self.store.get(key).and_then(Cached::into_value)
    }

    fn claim_id(&self) -> u64 {
        self.next_claim.fetch_add(1, Ordering::Relaxed)
    }

    /// Tenta reivindicar a chave e, se conseguir, dispara o fetch em background.
    ///
    /// Precisa de três coisas livres: uma permissão de refresh, a marca de
    /// refresh em andamento da chave e a guarda `:delay`.
    fn spawn_refresh<F, Fut, E>(&self, key: String, fetch: F, policy: CachePolicy)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Ok(permit) = self.refresh_permits.clone().try_acquire_owned() else {
            debug!("refresh de {key} ignorado: limite de refreshes atingido ou cache encerrado");
            return;
        };

        let Some(in_flight) = InFlight::claim(&self.in_flight, &key) else {
            debug!("refresh de {key} ignorado: outro refresh ainda em andamento");
            return;
        };

        let guard_key = Self::guard_key(&key);
        let claim = self.claim_id();
        if !self
            .store
            .set_nx(guard_key.clone(), Cached::RefreshGuard(claim), policy.refresh_delay)
        {
            return;
        }

        debug!("refresh iniciado: {key}");
        let store = self.store.clone();
        let fetch_timeout = self.fetch_timeout;
        tokio::spawn(async move {
            let _permit = permit;
            let _in_flight = in_flight;
            match timeout(fetch_timeout, fetch()).await {
                Ok(Ok(value)) => {
                    store.set(key.as_str(), Cached::Value(value), policy.ttl);
                    debug!("refresh concluído: {key}");
                }
                Ok(Err(e)) => {
                    release_guard(&store, &guard_key, claim);
                    warn!("falha ao atualizar cache de {key}: {e}");
                }
                Err(_) => {
                    release_guard(&store, &guard_key, claim);
                    warn!("refresh de {key} excedeu o timeout de {fetch_timeout:?}");
                }
            }
        });
    }

    /// Para de aceitar refreshes e espera até `grace` pelos que estão em andamento.
    ///
    /// Os que não terminarem no prazo são abandonados.
    pub async fn shutdown(&self, grace: Duration) {
        match timeout(grace, self.refresh_permits.acquire_many(self.max_refreshes)).await {
            Ok(Ok(permits)) => {
                self.refresh_permits.close();
                drop(permits);
                info!("refreshes em background drenados");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                self.refresh_permits.close();
                warn!(
                    "abandonando {} refreshes em andamento após {grace:?}",
                    self.refreshes_in_flight()
                );
            }
        }
    }
}

/// Libera a guarda só se ela ainda for a reivindicada por `claim`.
fn release_guard<V>(store: &Store<Cached<V>>, guard_key: &str, claim: u64)
where
    V: Clone + Send + Sync + 'static,
{
    store.delete_if(guard_key, |v| matches!(v, Cached::RefreshGuard(id) if *id == claim));
}

fn escape_key_part(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

/// Marca de refresh em andamento; liberada quando a task termina ou é abortada.
struct InFlight {
    keys: Arc<DashMap<String, ()>>,
    key: String,
}

impl InFlight {
    fn claim(keys: &Arc<DashMap<String, ()>>, key: &str) -> Option<Self> {
        match keys.entry(key.to_string()) {
            MapEntry::Occupied(_) => None,
            MapEntry::Vacant(vacant) => {
                vacant.insert(());
                Some(Self {
                    keys: Arc::clone(keys),
                    key: key.to_string(),
                })
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Ready;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> RefreshCache<String> {
        RefreshCache::with_limits(Store::new(), Duration::from_millis(200), 8)
    }

    fn policy(ttl_ms: u64, delay_ms: u64) -> CachePolicy {
        CachePolicy::new(Duration::from_millis(ttl_ms), Duration::from_millis(delay_ms))
    }

    fn counted(
        calls: Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> Ready<Result<String, io::Error>> + Send + 'static {
        let value = value.to_string();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    fn failing(
        calls: Arc<AtomicUsize>,
    ) -> impl FnOnce() -> Ready<Result<String, io::Error>> + Send + 'static {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(io::Error::other("upstream indisponível")))
        }
    }

    #[tokio::test]
    async fn miss_fetches_once_then_hits() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 500);

        let v = cache
            .get_or_fetch("spot_tickerprice", "BTCUSDT", counted(calls.clone(), "A"), p)
            .await
            .unwrap();
        assert_eq!(v, "A");

        let v = cache
            .get_or_fetch("spot_tickerprice", "BTCUSDT", counted(calls.clone(), "B"), p)
            .await
            .unwrap();
        assert_eq!(v, "A");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn miss_populates_value_and_guard() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = counted(calls.clone(), "A");
        cache
            .get_or_fetch("spot_depth", "BTCUSDT-10", fetch, policy(60_000, 500))
            .await
            .unwrap();

        let store = cache.store();
        assert_eq!(
            store.get("spot_depth:BTCUSDT-10"),
            Some(Cached::Value("A".to_string()))
        );
        assert!(matches!(
            store.get("spot_depth:BTCUSDT-10:delay"),
            Some(Cached::RefreshGuard(_))
        ));
    }

    #[tokio::test]
    async fn miss_failure_propagates_and_caches_nothing() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 500);

        let err = cache
            .get_or_fetch("spot_avgprice", "BTCUSDT", failing(calls.clone()), p)
            .await
            .unwrap_err();

        assert_eq!(err.key(), "spot_avgprice:BTCUSDT");
        assert_eq!(
            err.upstream().map(|e| e.to_string()),
            Some("upstream indisponível".to_string())
        );
        assert!(cache.store().is_empty());

        // Próxima chamada tenta de novo em vez de servir a falha
        let v = cache
            .get_or_fetch("spot_avgprice", "BTCUSDT", counted(calls.clone(), "A"), p)
            .await
            .unwrap();
        assert_eq!(v, "A");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn miss_timeout_is_a_failure() {
        let cache = RefreshCache::with_limits(Store::new(), Duration::from_millis(30), 8);

        let err = cache
            .get_or_fetch(
                "spot_klines",
                "BTCUSDT-1m-10",
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, io::Error>("late".to_string())
                },
                policy(60_000, 500),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Timeout { .. }));
        assert!(cache.store().is_empty());
    }

    #[tokio::test]
    async fn hit_within_delay_does_not_refresh() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 500);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        for _ in 0..10 {
            cache.get_or_fetch("c", "k", counted(calls.clone(), "B"), p).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refreshes_in_flight(), 0);
    }

    #[tokio::test]
    async fn hit_after_delay_refreshes_in_background() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 50);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Valor antigo volta na hora; o novo chega pelo refresh
        let v = cache.get_or_fetch("c", "k", counted(calls.clone(), "B"), p).await.unwrap();
        assert_eq!(v, "A");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.store().get("c:k"),
            Some(Cached::Value("B".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_hits_fetch_at_most_once_more() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 500);

        let v = cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        assert_eq!(v, "A");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let fetch = counted(calls.clone(), "B");
            handles.push(tokio::spawn(async move {
                cache.get_or_fetch("c", "k", fetch, p).await.unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "A");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_hits_after_delay_refresh_exactly_once() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 100);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let fetch = move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, io::Error>("B".to_string())
                };
                cache.get_or_fetch("c", "k", fetch, p).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_value_and_releases_guard() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 50);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let v = cache.get_or_fetch("c", "k", failing(calls.clone()), p).await.unwrap();
        assert_eq!(v, "A");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.store().get("c:k"),
            Some(Cached::Value("A".to_string()))
        );
        assert!(!cache.store().has("c:k:delay"));

        // Guarda liberada: o próximo hit já pode tentar de novo
        let v = cache.get_or_fetch("c", "k", counted(calls.clone(), "B"), p).await.unwrap();
        assert_eq!(v, "A");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            cache.store().get("c:k"),
            Some(Cached::Value("B".to_string()))
        );
    }

    #[tokio::test]
    async fn refresh_timeout_releases_guard() {
        let cache = RefreshCache::with_limits(Store::new(), Duration::from_millis(30), 8);
        let p = policy(60_000, 10_000);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        cache.store().delete("c:k:delay");

        let v = cache
            .get_or_fetch(
                "c",
                "k",
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, io::Error>("late".to_string())
                },
                p,
            )
            .await
            .unwrap();
        assert_eq!(v, "A");
        assert!(cache.store().has("c:k:delay"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!cache.store().has("c:k:delay"));
        assert_eq!(cache.refreshes_in_flight(), 0);
        assert_eq!(
            cache.store().get("c:k"),
            Some(Cached::Value("A".to_string()))
        );
    }

    #[tokio::test]
    async fn expired_value_is_fetched_again() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(50, 10);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let v = cache.get_or_fetch("c", "k", counted(calls.clone(), "B"), p).await.unwrap();
        assert_eq!(v, "B");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_refresh_independently() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 50);

        cache.get_or_fetch("c", "a", counted(calls.clone(), "A1"), p).await.unwrap();
        cache.get_or_fetch("c", "b", counted(calls.clone(), "B1"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        cache.get_or_fetch("c", "a", counted(calls.clone(), "A2"), p).await.unwrap();
        cache.get_or_fetch("c", "b", counted(calls.clone(), "B2"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.store().get("c:a"), Some(Cached::Value("A2".to_string())));
        assert_eq!(cache.store().get("c:b"), Some(Cached::Value("B2".to_string())));
    }

    #[tokio::test]
    async fn shutdown_stops_background_refreshes() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 10);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        cache.shutdown(Duration::from_millis(100)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Hits continuam servindo, mas nenhum refresh é disparado
        let v = cache.get_or_fetch("c", "k", counted(calls.clone(), "B"), p).await.unwrap();
        assert_eq!(v, "A");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.store().has("c:k:delay"));
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_refresh() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 10);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache
            .get_or_fetch(
                "c",
                "k",
                || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, io::Error>("B".to_string())
                },
                p,
            )
            .await
            .unwrap();
        assert_eq!(cache.refreshes_in_flight(), 1);

        cache.shutdown(Duration::from_secs(1)).await;
        assert_eq!(cache.store().get("c:k"), Some(Cached::Value("B".to_string())));
    }

    #[tokio::test]
    async fn slow_refresh_is_never_duplicated() {
        let cache = RefreshCache::with_limits(Store::new(), Duration::from_secs(2), 8);
        let calls = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 50);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();

        // Cada hit cai depois da guarda expirar, com o primeiro refresh ainda rodando
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(70)).await;
            let (calls, running, peak) = (calls.clone(), running.clone(), peak.clone());
            let fetch = move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(400)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, io::Error>("B".to_string())
            };
            assert_eq!(cache.get_or_fetch("c", "k", fetch, p).await.unwrap(), "A");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.refreshes_in_flight(), 0);
        assert_eq!(cache.store().get("c:k"), Some(Cached::Value("B".to_string())));

        // Terminado o refresh, a chave volta a poder ser atualizada
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.get_or_fetch("c", "k", counted(calls.clone(), "C"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.store().get("c:k"), Some(Cached::Value("C".to_string())));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_guard_claimed_by_someone_else() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 50);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let slow_failure = || async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Err::<String, _>(io::Error::other("upstream indisponível"))
        };
        cache.get_or_fetch("c", "k", slow_failure, p).await.unwrap();

        // Outra reivindicação toma a guarda enquanto o refresh ainda roda
        let other = Cached::RefreshGuard(u64::MAX);
        cache.store().set("c:k:delay", other.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.refreshes_in_flight(), 0);
        assert_eq!(cache.store().get("c:k:delay"), Some(other));
    }

    #[test]
    fn logical_keys_never_look_like_guards() {
        type Cache = RefreshCache<String>;

        assert_eq!(Cache::key_for("spot_depth", "BTCUSDT-10"), "spot_depth:BTCUSDT-10");
        assert_eq!(Cache::key_for("c", "k:delay"), "c:k%3Adelay");
        assert_eq!(Cache::key_for("c:k", "delay"), "c%3Ak:delay");
        assert_eq!(Cache::key_for("c", "k%3Adelay"), "c:k%253Adelay");
        assert_ne!(
            Cache::key_for("c", "k:delay"),
            Cache::guard_key(&Cache::key_for("c", "k"))
        );
    }

    #[tokio::test]
    async fn suffix_ending_in_delay_does_not_hijack_guard() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = policy(60_000, 50);

        cache.get_or_fetch("c", "k", counted(calls.clone(), "A"), p).await.unwrap();
        let v = cache
            .get_or_fetch("c", "k:delay", counted(calls.clone(), "OTHER"), p)
            .await
            .unwrap();
        assert_eq!(v, "OTHER");
        assert!(matches!(
            cache.store().get("c:k:delay"),
            Some(Cached::RefreshGuard(_))
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let v = cache.get_or_fetch("c", "k", counted(calls.clone(), "B"), p).await.unwrap();
        assert_eq!(v, "A");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.store().get("c:k"), Some(Cached::Value("B".to_string())));
    }
}
