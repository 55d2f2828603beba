//! # Session Hub (C10)
//!
//! Bus de diffusion des `ProcessedEvent` vers les abonnés WebSocket, par
//! canal et par un bus `"all"` transverse. Chaque abonné a sa propre file
//! bornée, à la différence du `Client { sender: UnboundedSender<Message> }`
//! non borné du teacher — ici la contre-pression est un choix délibéré
//! (§4.10, §5) : sous publication plus rapide que la lecture, l'événement le
//! plus ancien de la file est abandonné au profit du nouveau plutôt que de
//! laisser la mémoire croître sans borne ou de bloquer l'orchestrateur.
//! `tokio::sync::mpsc` ne permet pas d'évincer sa propre tête, donc la file
//! par abonné est un anneau `Mutex<VecDeque<_>>` notifié par
//! `tokio::sync::Notify`, pas un `mpsc::channel`.
//!
//! Heartbeat à l'image de `Client::is_alive(timeout)` du teacher : ping
//! toutes les 30s, déconnexion après deux pings manqués.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::metrics::PipelineMetrics;
use crate::models::ProcessedEvent;

const DEFAULT_QUEUE_SIZE: usize = 64;
const ALL_CHANNELS: &str = "__all__";

/// Identifiant opaque d'abonné, unique pour la durée de vie du process.
pub type SubscriberId = u64;

/// File bornée à un seul consommateur, avec éviction du plus ancien élément
/// quand elle est pleine (§4.10).
struct BoundedQueue {
    items: Mutex<VecDeque<ProcessedEvent>>,
    notify: Notify,
    capacity: usize,
    closed: std::sync::atomic::AtomicBool,
    lag: AtomicU64,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: std::sync::atomic::AtomicBool::new(false),
            lag: AtomicU64::new(0),
        }
    }

    /// Returns `true` if pushing this event evicted the oldest queued one.
    async fn push(&self, event: ProcessedEvent) -> bool {
        let mut items = self.items.lock().await;
        let evicted = items.len() >= self.capacity;
        if evicted {
            items.pop_front();
            self.lag.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(event);
        drop(items);
        self.notify.notify_one();
        evicted
    }

    async fn pop(&self) -> Option<ProcessedEvent> {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(event) = items.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Abonné enregistré auprès du hub.
struct Subscriber {
    queue: Arc<BoundedQueue>,
    last_heartbeat: Arc<std::sync::RwLock<Instant>>,
}

impl Subscriber {
    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat
            .read()
            .map(|t| t.elapsed() < timeout)
            .unwrap_or(false)
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_heartbeat.write() {
            *guard = Instant::now();
        }
    }
}

/// Récepteur donné à l'appelant lors d'un abonnement.
pub struct Subscription {
    pub id: SubscriberId,
    queue: Arc<BoundedQueue>,
    heartbeat: Arc<std::sync::RwLock<Instant>>,
}

impl Subscription {
    /// Attend et retourne le prochain événement, `None` une fois désabonné.
    pub async fn recv(&mut self) -> Option<ProcessedEvent> {
        self.queue.pop().await
    }

    pub fn touch_heartbeat(&self) {
        if let Ok(mut guard) = self.heartbeat.write() {
            *guard = Instant::now();
        }
    }

    pub fn lag(&self) -> u64 {
        self.queue.lag.load(Ordering::Relaxed)
    }
}

/// Hub de diffusion : un ensemble d'abonnés par canal, plus le bus `"all"`.
///
/// Un même abonné ne peut recevoir un événement en double même s'il est
/// abonné au canal et au bus `all` simultanément ; `publish` dé-duplique par
/// `SubscriberId` avant l'envoi (§4.10 ordering guarantee). Pour un
/// `(channel_id, subscriber)` donné, les événements sont remis dans l'ordre
/// d'appel de `publish`.
pub struct SessionHub {
    channels: RwLock<HashMap<String, HashMap<SubscriberId, ()>>>,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    queue_size: usize,
    heartbeat_timeout: Duration,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl SessionHub {
    pub fn new(queue_size: usize, heartbeat_timeout: Duration) -> Self {
        Self::with_metrics(queue_size, heartbeat_timeout, None)
    }

    pub fn with_metrics(
        queue_size: usize,
        heartbeat_timeout: Duration,
        metrics: Option<Arc<PipelineMetrics>>,
    ) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_size: if queue_size == 0 {
                DEFAULT_QUEUE_SIZE
            } else {
                queue_size
            },
            heartbeat_timeout,
            metrics,
        }
    }

    /// Abonne un nouveau client à un canal (ou au bus `all` si `channel_id` est `None`).
    pub async fn subscribe(&self, channel_id: Option<&str>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(BoundedQueue::new(self.queue_size));
        let heartbeat = Arc::new(std::sync::RwLock::new(Instant::now()));

        self.subscribers.write().await.insert(
            id,
            Subscriber {
                queue: Arc::clone(&queue),
                last_heartbeat: Arc::clone(&heartbeat),
            },
        );

        let key = channel_id.unwrap_or(ALL_CHANNELS).to_string();
        self.channels
            .write()
            .await
            .entry(key)
            .or_default()
            .insert(id, ());

        Subscription {
            id,
            queue,
            heartbeat,
        }
    }

    /// Retire un abonné et le dé-enregistre de tous les canaux.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        if let Some(subscriber) = self.subscribers.write().await.remove(&id) {
            subscriber.queue.close();
        }
        let mut channels = self.channels.write().await;
        channels.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }

    /// Publie un événement aux abonnés du canal concerné et du bus `all`.
    /// Non bloquant pour l'appelant : chaque abonné a sa propre file, et une
    /// file pleine abandonne son plus ancien élément plutôt que de retarder
    /// la publication ou les autres abonnés.
    pub async fn publish(&self, event: ProcessedEvent) {
        let mut targets: Vec<SubscriberId> = Vec::new();
        {
            let channels = self.channels.read().await;
            if let Some(members) = channels.get(&event.channel_id) {
                targets.extend(members.keys().copied());
            }
            if let Some(members) = channels.get(ALL_CHANNELS) {
                for id in members.keys() {
                    if !targets.contains(id) {
                        targets.push(*id);
                    }
                }
            }
        }

        let subscribers = self.subscribers.read().await;
        for id in targets {
            if let Some(subscriber) = subscribers.get(&id) {
                if subscriber.queue.push(event.clone()).await {
                    if let Some(metrics) = &self.metrics {
                        metrics.session_lag(&event.channel_id).await;
                    }
                }
            }
        }
    }

    /// Enregistre un heartbeat reçu pour un abonné (ping/pong transport).
    pub async fn record_heartbeat(&self, id: SubscriberId) {
        if let Some(subscriber) = self.subscribers.read().await.get(&id) {
            subscriber.touch();
        }
    }

    /// Lag cumulé (événements abandonnés) pour un abonné, exposé en métriques.
    pub async fn lag(&self, id: SubscriberId) -> u64 {
        self.subscribers
            .read()
            .await
            .get(&id)
            .map(|s| s.queue.lag.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Évince les abonnés inactifs depuis plus de `heartbeat_timeout` (reaper paresseux).
    pub async fn reap_stale(&self) {
        let stale: Vec<SubscriberId> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|(_, s)| !s.is_alive(self.heartbeat_timeout))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale {
            self.unsubscribe(id).await;
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Boucle de réaping périodique en tâche de fond.
    pub async fn run_reaper_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.reap_stale().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, FilterOutcome, IncomingMessage, ModerationVerdict};

    fn sample_event(channel_id: &str) -> ProcessedEvent {
        let msg = IncomingMessage::new("u1", "alice", channel_id, "hello");
        ProcessedEvent::new(
            msg,
            FilterOutcome::pass(10),
            ModerationVerdict::fallback_unknown("n/a", 10),
            Action::allow(),
            10,
        )
    }

    #[tokio::test]
    async fn subscriber_receives_event_published_on_its_channel() {
        let hub = SessionHub::new(64, Duration::from_secs(60));
        let mut sub = hub.subscribe(Some("c1")).await;
        hub.publish(sample_event("c1")).await;
        let event = sub.recv().await.unwrap();
        assert_eq!(event.channel_id, "c1");
    }

    #[tokio::test]
    async fn subscriber_on_other_channel_does_not_receive() {
        let hub = SessionHub::new(64, Duration::from_secs(60));
        let mut sub = hub.subscribe(Some("c2")).await;
        hub.publish(sample_event("c1")).await;
        let result = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "expected no event within timeout");
    }

    #[tokio::test]
    async fn all_bus_subscriber_receives_every_channel() {
        let hub = SessionHub::new(64, Duration::from_secs(60));
        let mut sub = hub.subscribe(None).await;
        hub.publish(sample_event("c1")).await;
        hub.publish(sample_event("c2")).await;
        assert_eq!(sub.recv().await.unwrap().channel_id, "c1");
        assert_eq!(sub.recv().await.unwrap().channel_id, "c2");
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery() {
        let hub = SessionHub::new(64, Duration::from_secs(60));
        let sub = hub.subscribe(Some("c1")).await;
        hub.unsubscribe(sub.id).await;
        hub.publish(sample_event("c1")).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn stale_subscriber_is_reaped() {
        let hub = SessionHub::new(64, Duration::from_millis(5));
        let _sub = hub.subscribe(Some("c1")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.reap_stale().await;
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_keeps_newest() {
        let hub = SessionHub::new(1, Duration::from_secs(60));
        let mut sub = hub.subscribe(Some("c1")).await;
        hub.publish(sample_event("c1")).await;
        hub.publish(sample_event("c1")).await;
        assert!(hub.lag(sub.id).await >= 1);
        // only the newest of the two survives in a capacity-1 queue
        let received = sub.recv().await.unwrap();
        assert_eq!(received.channel_id, "c1");
        let result = tokio::time::timeout(Duration::from_millis(20), sub.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ordering_is_preserved_per_subscriber() {
        let hub = SessionHub::new(64, Duration::from_secs(60));
        let mut sub = hub.subscribe(Some("c1")).await;
        for i in 0..5 {
            let msg = IncomingMessage::new("u1", "alice", "c1", format!("msg-{i}"));
            hub.publish(ProcessedEvent::new(
                msg,
                FilterOutcome::pass(1),
                ModerationVerdict::fallback_unknown("n/a", 1),
                Action::allow(),
                1,
            ))
            .await;
        }
        for i in 0..5 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.message.body, format!("msg-{i}"));
        }
    }
}
