use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use serde::Serialize;

/// Cache entry avec expiration
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at: Instant,
    pub hit_count: u64,
    pub last_accessed: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now + ttl,
            hit_count: 0,
            last_accessed: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn touch(&mut self) {
        self.hit_count += 1;
        self.last_accessed = Instant::now();
    }
}

/// Cache intelligent avec LRU et expiration
pub struct SmartCache<K, V> 
where 
    K: Clone + std::hash::Hash + Eq,
    V: Clone,
{
    entries: Arc<RwLock<HashMap<K, CacheEntry<V>>>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<K, V> SmartCache<K, V>
where 
    K: Clone + std::hash::Hash + Eq,
    V: Clone,
{
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_size,
            default_ttl,
        }
    }

    /// Ins√®re une valeur dans le cache
    pub async fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl).await;
    }

    /// Ins√®re une valeur avec un TTL personnalis√©
    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.write().await;
        
        // Nettoyage des entr√©es expir√©es
        self.cleanup_expired(&mut entries).await;
        
        // √âviction LRU si le cache est plein
        if entries.len() >= self.max_size {
            self.evict_lru(&mut entries).await;
        }

        entries.insert(key, CacheEntry::new(value, ttl));
    }

    /// R√©cup√®re une valeur du cache
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;
        
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired() {
                entries.remove(key);
                return None;
            }
            
            entry.touch();
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Supprime une entr√©e du cache
    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;
        entries.remove(key).map(|entry| entry.value)
    }

    /// Nettoie les entr√©es expir√©es
    async fn cleanup_expired(&self, entries: &mut HashMap<K, CacheEntry<V>>) {
        let expired_keys: Vec<K> = entries.iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired_keys {
            entries.remove(&key);
        }
    }

    /// √âviction LRU (Least Recently Used)
    async fn evict_lru(&self, entries: &mut HashMap<K, CacheEntry<V>>) {
        if let Some((lru_key, _)) = entries.iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, entry)| (key.clone(), entry.clone())) {
            entries.remove(&lru_key);
        }
    }

    /// Statistiques du cache
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let total_hits: u64 = entries.values().map(|entry| entry.hit_count).sum();
        
        CacheStats {
            total_entries: entries.len(),
            max_size: self.max_size,
            total_hits,
            hit_rate: if entries.is_empty() { 0.0 } else { total_hits as f64 / entries.len() as f64 },
        }
    }

    /// Vide le cache
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub max_size: usize,
    pub total_hits: u64,
    pub hit_rate: f64,
}
