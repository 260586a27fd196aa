//! Polling watch loop.
//!
//! Manufactures watch semantics for backends without a push channel. Each
//! tick fetches the full collection plus an optional freshness token; an
//! unchanged token makes the tick a no-op, so an idle backend produces no
//! notification storm.

use crate::{CollectionHandler, StorageError, Watch};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Snapshot provider for a [`PollWatcher`].
#[async_trait::async_trait]
pub trait PollSource<T>: Send + Sync {
    /// Returns the full collection and, where the backend offers one, a
    /// freshness token (Consul: the listing's last index; file: `None`,
    /// every tick re-reads).
    async fn poll(&self) -> Result<(Vec<T>, Option<u64>), StorageError>;
}

/// Generic poll loop used by the file and Consul backends.
pub struct PollWatcher<T> {
    source: Box<dyn PollSource<T>>,
    handlers: Vec<Arc<dyn CollectionHandler<T>>>,
    sync_frequency: Duration,
    last_token: Option<u64>,
}

impl<T: Clone + Send + Sync + 'static> PollWatcher<T> {
    pub fn new(
        source: Box<dyn PollSource<T>>,
        sync_frequency: Duration,
        handlers: Vec<Arc<dyn CollectionHandler<T>>>,
    ) -> Self {
        Self {
            source,
            handlers,
            sync_frequency,
            last_token: None,
        }
    }

    /// One poll cycle: fetch, compare the freshness token, notify handlers
    /// if the view changed.
    async fn tick(&mut self) -> Result<(), StorageError> {
        let (objects, token) = self.source.poll().await?;

        if token.is_some() && token == self.last_token {
            debug!("freshness token unchanged, skipping notification");
            return Ok(());
        }
        self.last_token = match (token, self.last_token) {
            // an index that moves backwards is reset per Consul's
            // blocking-query contract, forcing the next tick to renotify
            (Some(new), Some(old)) if new < old => Some(0),
            (new, _) => new,
        };

        for handler in &self.handlers {
            handler.on_update(objects.clone());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync + 'static> Watch for PollWatcher<T> {
    async fn run(
        mut self: Box<Self>,
        mut stop: watch::Receiver<bool>,
        errors: mpsc::Sender<StorageError>,
    ) {
        let mut interval = tokio::time::interval(self.sync_frequency);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(%err, "poll failed, retrying next tick");
                        if errors.send(err).await.is_err() {
                            // nobody is listening anymore
                            break;
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        responses: Mutex<VecDeque<Result<(Vec<String>, Option<u64>), StorageError>>>,
    }

    impl Scripted {
        fn new(
            responses: Vec<Result<(Vec<String>, Option<u64>), StorageError>>,
        ) -> Box<Self> {
            Box::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl PollSource<String> for Scripted {
        async fn poll(&self) -> Result<(Vec<String>, Option<u64>), StorageError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok((Vec::new(), None)))
        }
    }

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl CollectionHandler<String> for Collector {
        fn on_update(&self, objects: Vec<String>) {
            self.seen.lock().unwrap().push(objects);
        }
    }

    fn watcher(
        source: Box<Scripted>,
        handlers: Vec<Arc<dyn CollectionHandler<String>>>,
    ) -> PollWatcher<String> {
        PollWatcher::new(source, Duration::from_secs(1), handlers)
    }

    #[tokio::test]
    async fn unchanged_token_suppresses_notification() {
        let collector = Arc::new(Collector::default());
        let source = Scripted::new(vec![
            Ok((vec!["a".into()], Some(7))),
            Ok((vec!["a".into()], Some(7))),
        ]);
        let mut poller = watcher(source, vec![collector.clone()]);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();

        assert_eq!(collector.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_token_notifies_every_handler_once() {
        let first = Arc::new(Collector::default());
        let second = Arc::new(Collector::default());
        let source = Scripted::new(vec![
            Ok((vec!["a".into()], Some(1))),
            Ok((vec!["a".into(), "b".into()], Some(2))),
        ]);
        let mut poller = watcher(source, vec![first.clone(), second.clone()]);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();

        let seen = first.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(second.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tokenless_source_always_notifies() {
        let collector = Arc::new(Collector::default());
        let source = Scripted::new(vec![
            Ok((vec!["a".into()], None)),
            Ok((vec!["a".into()], None)),
        ]);
        let mut poller = watcher(source, vec![collector.clone()]);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();

        assert_eq!(collector.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fetch_error_does_not_poison_later_ticks() {
        let collector = Arc::new(Collector::default());
        let source = Scripted::new(vec![
            Err(StorageError::Watch("transient".to_string())),
            Ok((vec!["a".into()], Some(1))),
        ]);
        let mut poller = watcher(source, vec![collector.clone()]);

        assert!(poller.tick().await.is_err());
        poller.tick().await.unwrap();

        assert_eq!(collector.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backwards_token_forces_renotification() {
        let collector = Arc::new(Collector::default());
        let source = Scripted::new(vec![
            Ok((vec!["a".into()], Some(9))),
            Ok((vec!["a".into()], Some(3))),
            Ok((vec!["a".into()], Some(3))),
        ]);
        let mut poller = watcher(source, vec![collector.clone()]);

        poller.tick().await.unwrap();
        poller.tick().await.unwrap();
        // token was reset, so the same index notifies again once
        poller.tick().await.unwrap();

        assert_eq!(collector.seen.lock().unwrap().len(), 3);
    }
}
