use std::{collections::HashMap, sync::Mutex};

use tokio::time::Instant;

/// In-flight probe messages: token -> time the message was sent.
///
/// Entries leave only through [`MessageMap::take`]; a message that is never
/// delivered stays here for the life of the process.
#[derive(Debug, Default)]
pub struct MessageMap {
    inner: Mutex<HashMap<String, Instant>>,
}

impl MessageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `token` as sent at `sent_at`, replacing any earlier entry.
    pub fn add(&self, token: impl Into<String>, sent_at: Instant) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(token.into(), sent_at);
    }

    /// Remove `token` and return its send time, or `None` if it is unknown
    /// or was already taken.
    pub fn take(&self, token: &str) -> Option<Instant> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(token)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn test_take_returns_send_time_once() {
        let map = MessageMap::new();
        let t0 = Instant::now();

        map.add("abc", t0);

        assert_eq!(map.take("abc"), Some(t0));
        assert_eq!(map.take("abc"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_unknown_token() {
        let map = MessageMap::new();
        map.add("abc", Instant::now());
        assert_eq!(map.take("zzz"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_repeated_add_overwrites() {
        let map = MessageMap::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(5);

        map.add("abc", t0);
        map.add("abc", t1);

        assert_eq!(map.len(), 1);
        assert_eq!(map.take("abc"), Some(t1));
    }

    #[test]
    fn test_entries_persist_without_eviction() {
        // No-eviction policy: an unanswered send is never expired.
        let map = MessageMap::new();
        let t0 = Instant::now();
        map.add("orphan", t0);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(map.len(), 1);
        assert_eq!(map.take("orphan"), Some(t0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_then_takes() {
        const N: usize = 500;
        let map = Arc::new(MessageMap::new());

        let adders: Vec<_> = (0..N)
            .map(|i| {
                let map = map.clone();
                tokio::spawn(async move { map.add(format!("token-{i}"), Instant::now()) })
            })
            .collect();
        for handle in adders {
            handle.await.unwrap();
        }
        assert_eq!(map.len(), N);

        let hits = (0..N)
            .rev()
            .filter(|i| map.take(&format!("token-{i}")).is_some())
            .count();

        assert_eq!(hits, N);
        assert!(map.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_with_single_taker() {
        const N: usize = 200;
        let map = Arc::new(MessageMap::new());

        let taker = {
            let map = map.clone();
            tokio::spawn(async move {
                let mut hits = 0;
                while hits < N {
                    for i in 0..N {
                        if map.take(&format!("token-{i}")).is_some() {
                            hits += 1;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                hits
            })
        };

        for i in 0..N {
            let map = map.clone();
            tokio::spawn(async move { map.add(format!("token-{i}"), Instant::now()) });
        }

        assert_eq!(taker.await.unwrap(), N);
        assert!(map.is_empty());
    }
}
