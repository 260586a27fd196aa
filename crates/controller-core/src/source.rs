//! Change-notification sources.
//!
//! A source pushes [`WorkItem`]s onto the controller's queue. The only
//! production source is [`KubeSource`], which adapts a Kubernetes watch
//! stream; tests supply their own.

use crate::queue::{Event, EventQueue, WorkItem};
use futures::TryStreamExt;
use kube::api::ListParams;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::WatchStreamExt;
use kube_runtime::watcher::{self, watcher};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// A producer of change notifications for objects of type `T`.
#[async_trait::async_trait]
pub trait NotificationSource<T>: Send + 'static {
    /// Source name used in error context.
    fn name(&self) -> &str;

    /// Blocks until the source's initial state is reachable. Failure here is
    /// fatal to the owning controller's `run`.
    async fn sync(&mut self) -> anyhow::Result<()>;

    /// Delivery loop; runs until `stop` signals.
    async fn run(self: Box<Self>, queue: Arc<EventQueue<T>>, stop: watch::Receiver<bool>);
}

/// Adapts a Kubernetes watch into Added/Updated/Deleted work items.
///
/// The watcher replays the full collection on (re)connect; keys seen before
/// map to `Updated`, unseen keys to `Added`, and keys that vanish between
/// replays to `Deleted`, so downstream handlers observe a coherent stream
/// across restarts.
pub struct KubeSource<K>
where
    K: Resource,
{
    api: Api<K>,
    name: String,
}

impl<K> KubeSource<K>
where
    K: Resource,
{
    pub fn new(api: Api<K>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{ns}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}

#[async_trait::async_trait]
impl<K> NotificationSource<K> for KubeSource<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Clone + Eq + std::hash::Hash + Debug + Unpin,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync(&mut self) -> anyhow::Result<()> {
        // one cheap list proves the API is reachable and we are authorized
        self.api.list_metadata(&ListParams::default().limit(1)).await?;
        Ok(())
    }

    async fn run(self: Box<Self>, queue: Arc<EventQueue<K>>, mut stop: watch::Receiver<bool>) {
        info!(source = %self.name, "starting watch");
        let stream = watcher(self.api, watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        let mut known: HashMap<String, K> = HashMap::new();
        let mut replayed: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::Init)) => replayed.clear(),
                    Ok(Some(watcher::Event::InitApply(obj))) => {
                        let key = object_key(&obj);
                        replayed.insert(key.clone());
                        apply(&queue, &mut known, key, obj);
                    }
                    Ok(Some(watcher::Event::InitDone)) => {
                        let gone: Vec<String> = known
                            .keys()
                            .filter(|key| !replayed.contains(*key))
                            .cloned()
                            .collect();
                        for key in gone {
                            if let Some(obj) = known.remove(&key) {
                                queue.enqueue(WorkItem::new(key, Event::Deleted(obj)));
                            }
                        }
                    }
                    Ok(Some(watcher::Event::Apply(obj))) => {
                        let key = object_key(&obj);
                        apply(&queue, &mut known, key, obj);
                    }
                    Ok(Some(watcher::Event::Delete(obj))) => {
                        let key = object_key(&obj);
                        known.remove(&key);
                        queue.enqueue(WorkItem::new(key, Event::Deleted(obj)));
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(source = %self.name, %err, "watch stream error");
                    }
                },
            }
        }
        info!(source = %self.name, "watch stopped");
    }
}

fn apply<K: Clone>(queue: &EventQueue<K>, known: &mut HashMap<String, K>, key: String, obj: K) {
    let event = if known.insert(key.clone(), obj.clone()).is_some() {
        Event::Updated(obj)
    } else {
        Event::Added(obj)
    };
    queue.enqueue(WorkItem::new(key, event));
}
