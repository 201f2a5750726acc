use crate::synonyms::{SynonymMap, SynonymProvider};
use crate::tokenizer::normalize_sentence;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Normalized sentence to the synonym map found for it.
///
/// Every method normalizes its key, so callers may pass raw sentence text.
#[derive(Default)]
pub struct SynonymCache {
    entries: RwLock<HashMap<String, SynonymMap>>,
    generation: AtomicU64,
}

impl SynonymCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<SynonymMap> {
        self.entries.read().get(&normalize_sentence(key)).cloned()
    }

    pub fn put(&self, key: &str, value: SynonymMap) {
        self.entries.write().insert(normalize_sentence(key), value);
    }

    pub fn clear(&self) {
        let mut guard = self.entries.write();
        guard.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn export_all(&self) -> BTreeMap<String, SynonymMap> {
        self.entries
            .read()
            .iter()
            .map(|(key, map)| (key.clone(), map.clone()))
            .collect()
    }

    /// Inserts every entry, overwriting matching keys and keeping all others.
    pub fn restore_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, SynonymMap)>,
    {
        let mut guard = self.entries.write();
        for (key, map) in entries {
            guard.insert(normalize_sentence(&key), map);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Bumped on every `clear`, so lookups started before a clear can tell
    /// their result belongs to a previous session.
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn put_if_generation(&self, key: &str, value: SynonymMap, generation: u64) -> bool {
        let mut guard = self.entries.write();
        if self.generation() != generation {
            return false;
        }
        guard.insert(normalize_sentence(key), value);
        true
    }
}

type InFlight = Arc<Mutex<HashMap<String, broadcast::Sender<SynonymMap>>>>;

/// Cache-first synonym lookups with one outstanding provider call per key.
pub struct SynonymService {
    cache: Arc<SynonymCache>,
    provider: Arc<SynonymProvider>,
    in_flight: InFlight,
}

impl SynonymService {
    pub fn new(provider: SynonymProvider) -> Self {
        Self::with_cache(provider, Arc::new(SynonymCache::new()))
    }

    pub fn with_cache(provider: SynonymProvider, cache: Arc<SynonymCache>) -> Self {
        Self {
            cache,
            provider: Arc::new(provider),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &Arc<SynonymCache> {
        &self.cache
    }

    pub fn cached(&self, sentence: &str) -> Option<SynonymMap> {
        self.cache.get(sentence)
    }

    pub fn clear(&self) {
        let dropped = self.cache.len();
        self.cache.clear();
        info!(entries = dropped, "synonym cache cleared");
    }

    pub fn export_all(&self) -> BTreeMap<String, SynonymMap> {
        self.cache.export_all()
    }

    pub fn restore_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, SynonymMap)>,
    {
        self.cache.restore_all(entries);
        debug!(entries = self.cache.len(), "synonym cache restored");
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Returns the synonym map for `sentence`, calling the provider at most
    /// once per key no matter how many callers ask concurrently.
    pub async fn lookup(&self, sentence: &str) -> SynonymMap {
        let key = normalize_sentence(sentence);
        if key.is_empty() {
            return SynonymMap::new();
        }
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "synonym cache hit");
            return hit;
        }

        let generation = self.cache.generation();
        let mut receiver = {
            let mut in_flight = self.in_flight.lock();
            if let Some(sender) = in_flight.get(&key) {
                debug!(key = %key, "joining in-flight synonym lookup");
                sender.subscribe()
            } else if let Some(hit) = self.cache.get(&key) {
                return hit;
            } else {
                let (sender, receiver) = broadcast::channel(1);
                in_flight.insert(key.clone(), sender);
                self.spawn_fetch(key.clone(), sentence.trim().to_string());
                receiver
            }
        };

        match receiver.recv().await {
            Ok(map) => {
                // A fetch started before a clear is not cached by its own task.
                self.cache.put_if_generation(&key, map.clone(), generation);
                map
            }
            Err(err) => {
                debug!(key = %key, error = %err, "in-flight synonym lookup closed early");
                self.cache.get(&key).unwrap_or_default()
            }
        }
    }

    /// The provider call runs detached so it finishes and fills the cache even
    /// when every caller has gone away.
    fn spawn_fetch(&self, key: String, sentence: String) {
        let cache = Arc::clone(&self.cache);
        let provider = Arc::clone(&self.provider);
        let in_flight = Arc::clone(&self.in_flight);
        let generation = cache.generation();
        tokio::spawn(async move {
            let map = provider.lookup(&sentence).await;
            if !cache.put_if_generation(&key, map.clone(), generation) {
                debug!(key = %key, "cache cleared while lookup was in flight, result not cached");
            }
            let sender = in_flight.lock().remove(&key);
            if let Some(sender) = sender {
                let waiting = sender.receiver_count();
                debug!(key = %key, waiting, words = map.len(), "synonym lookup completed");
                let _ = sender.send(map);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedGenerator;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn map(word: &str, synonyms: &[&str]) -> SynonymMap {
        let mut map = SynonymMap::new();
        map.insert(
            word.to_string(),
            synonyms.iter().map(|s| s.to_string()).collect(),
        );
        map
    }

    fn service(generator: Arc<ScriptedGenerator>) -> SynonymService {
        SynonymService::new(SynonymProvider::new(generator))
    }

    #[test]
    fn put_then_get_returns_same_map() {
        let cache = SynonymCache::new();
        let value = map("very", &["extremely", "incredibly", "remarkably"]);
        let key = normalize_sentence("It was VERY fun ");
        cache.put(&key, value.clone());
        assert_eq!(cache.get(&key), Some(value.clone()));
        assert_eq!(cache.get("  it was very fun"), Some(value));
    }

    #[test]
    fn restore_is_additive_and_clear_empties() {
        let cache = SynonymCache::new();
        cache.put("keep me", map("keep", &["retain"]));
        cache.restore_all(vec![("Sad".to_string(), map("sad", &["unhappy"]))]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("sad").is_some());
        let exported = cache.export_all();
        assert_eq!(exported.keys().collect::<Vec<_>>(), vec!["keep me", "sad"]);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_generation_is_not_written() {
        let cache = SynonymCache::new();
        let generation = cache.generation();
        cache.clear();
        assert!(!cache.put_if_generation("late", SynonymMap::new(), generation));
        assert!(cache.get("late").is_none());
    }

    #[tokio::test]
    async fn identical_concurrent_lookups_call_provider_once() {
        let gate = Arc::new(Semaphore::new(0));
        let generator = Arc::new(ScriptedGenerator::gated(
            r#"{"very": ["extremely", "incredibly", "remarkably"]}"#,
            gate.clone(),
        ));
        let service = Arc::new(service(generator.clone()));

        let first = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.lookup("It was very fun").await }
        });
        let second = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.lookup("it was very fun  ").await }
        });
        while service.in_flight_count() == 0 || generator.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.add_permits(1);

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(first, second);
        assert!(first.contains_key("very"));
        assert_eq!(generator.calls(), 1);
        assert_eq!(service.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn cached_sentence_skips_provider() {
        let generator = Arc::new(ScriptedGenerator::always(r#"{"big": ["huge"]}"#));
        let service = service(generator.clone());
        service.lookup("A big dog").await;
        service.lookup("a big dog").await;
        assert_eq!(generator.calls(), 1);
        assert!(service.cached("A BIG DOG").is_some());
    }

    #[tokio::test]
    async fn degraded_result_is_cached_as_empty() {
        let generator = Arc::new(ScriptedGenerator::always("no json here"));
        let service = service(generator.clone());
        assert!(service.lookup("I ran").await.is_empty());
        assert_eq!(service.cached("I ran"), Some(SynonymMap::new()));
    }

    #[tokio::test]
    async fn blank_sentence_never_calls_provider() {
        let generator = Arc::new(ScriptedGenerator::always("{}"));
        let service = service(generator.clone());
        assert!(service.lookup("   ").await.is_empty());
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn lookup_joined_after_clear_is_cached_for_new_session() {
        let gate = Arc::new(Semaphore::new(0));
        let generator = Arc::new(ScriptedGenerator::gated(
            r#"{"sad": ["unhappy", "gloomy"]}"#,
            gate.clone(),
        ));
        let service = Arc::new(service(generator.clone()));

        let before_clear = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.lookup("I was sad").await }
        });
        while generator.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.clear();
        let after_clear = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.lookup("I was sad").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.add_permits(1);

        assert!(before_clear.await.unwrap().contains_key("sad"));
        assert!(after_clear.await.unwrap().contains_key("sad"));
        assert_eq!(generator.calls(), 1);
        assert_eq!(service.cached("i was sad").unwrap()["sad"], vec!["unhappy", "gloomy"]);
    }
}
