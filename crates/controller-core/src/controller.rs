//! Resource controller.
//!
//! Binds change-notification sources to an [`EventQueue`] and dispatches
//! queued items to per-event handler lists on a configurable number of
//! worker tasks. Handler errors re-queue the item (still rate-limited) and
//! are reported on the controller's error channel; they are never fatal to
//! a worker. Only a failed initial sync is fatal, and it is returned before
//! any worker starts.

use crate::error::ControllerError;
use crate::queue::{Event, EventQueue, WorkItem};
use crate::source::NotificationSource;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// A callback invoked for one kind of event.
#[async_trait::async_trait]
pub trait EventHandler<T>: Send + Sync {
    async fn handle(&self, object: &T) -> anyhow::Result<()>;
}

struct HandlerSet<T> {
    added: Vec<Arc<dyn EventHandler<T>>>,
    updated: Vec<Arc<dyn EventHandler<T>>>,
    deleted: Vec<Arc<dyn EventHandler<T>>>,
}

/// Dispatches change notifications for objects of type `T`.
pub struct ResourceController<T> {
    queue: Arc<EventQueue<T>>,
    sources: Vec<Box<dyn NotificationSource<T>>>,
    added: Vec<Arc<dyn EventHandler<T>>>,
    updated: Vec<Arc<dyn EventHandler<T>>>,
    deleted: Vec<Arc<dyn EventHandler<T>>>,
    errors_tx: mpsc::UnboundedSender<ControllerError>,
    errors_rx: Option<mpsc::UnboundedReceiver<ControllerError>>,
}

impl<T> Default for ResourceController<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceController<T>
where
    T: Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            queue: Arc::new(EventQueue::new()),
            sources: Vec::new(),
            added: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            errors_tx,
            errors_rx: Some(errors_rx),
        }
    }

    /// Attaches a notification source feeding the queue.
    pub fn add_source(&mut self, source: Box<dyn NotificationSource<T>>) {
        self.sources.push(source);
    }

    /// Registers a handler for `Added` events. Handlers run synchronously in
    /// registration order.
    pub fn on_added<H: EventHandler<T> + 'static>(&mut self, handler: H) {
        self.added.push(Arc::new(handler));
    }

    /// Registers a handler for `Updated` events.
    pub fn on_updated<H: EventHandler<T> + 'static>(&mut self, handler: H) {
        self.updated.push(Arc::new(handler));
    }

    /// Registers a handler for `Deleted` events.
    pub fn on_deleted<H: EventHandler<T> + 'static>(&mut self, handler: H) {
        self.deleted.push(Arc::new(handler));
    }

    /// Takes the error stream for the owning process to log. Non-fatal
    /// errors (handler failures, resync failures) are delivered here.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ControllerError>> {
        self.errors_rx.take()
    }

    /// A sender for reporting errors from sibling loops (resync tickers)
    /// into the same channel.
    pub fn error_sender(&self) -> mpsc::UnboundedSender<ControllerError> {
        self.errors_tx.clone()
    }

    /// Syncs every source, then runs the sources and `workers` worker loops
    /// until `stop` signals. A source that fails its initial sync aborts the
    /// run before any worker starts.
    pub async fn run(
        mut self,
        workers: usize,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        for source in &mut self.sources {
            let source_name = source.name().to_string();
            if let Err(err) = source.sync().await {
                return Err(ControllerError::InitialSync {
                    source_name,
                    source: err,
                });
            }
        }

        let handlers = Arc::new(HandlerSet {
            added: self.added,
            updated: self.updated,
            deleted: self.deleted,
        });

        let mut tasks = Vec::new();
        for source in self.sources {
            tasks.push(tokio::spawn(source.run(
                Arc::clone(&self.queue),
                stop.clone(),
            )));
        }
        for _ in 0..workers {
            let queue = Arc::clone(&self.queue);
            let handlers = Arc::clone(&handlers);
            let errors = self.errors_tx.clone();
            tasks.push(tokio::spawn(worker_loop(queue, handlers, errors)));
        }

        if !*stop.borrow() {
            // a dropped sender counts as a stop signal
            let _ = stop.changed().await;
        }
        self.queue.shutdown();

        for task in tasks {
            if let Err(err) = task.await {
                error!(%err, "controller task panicked");
            }
        }
        Ok(())
    }
}

async fn worker_loop<T>(
    queue: Arc<EventQueue<T>>,
    handlers: Arc<HandlerSet<T>>,
    errors: mpsc::UnboundedSender<ControllerError>,
) where
    T: Send + Sync + 'static,
{
    while let Some(WorkItem { key, event }) = queue.dispatch().await {
        let list = match &event {
            Event::Added(_) => &handlers.added,
            Event::Updated(_) => &handlers.updated,
            Event::Deleted(_) => &handlers.deleted,
        };

        let mut failed = false;
        for handler in list {
            if let Err(err) = handler.handle(event.object()).await {
                error!(key, %err, "handler failed, requeueing");
                let _ = errors.send(ControllerError::Handler {
                    key: key.clone(),
                    source: err,
                });
                failed = true;
                break;
            }
        }

        if failed {
            queue.enqueue(WorkItem { key, event });
        } else {
            debug!(key, "handled");
            queue.forget(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StaticSource {
        items: Vec<WorkItem<String>>,
    }

    #[async_trait::async_trait]
    impl NotificationSource<String> for StaticSource {
        fn name(&self) -> &str {
            "static"
        }

        async fn sync(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run(
            self: Box<Self>,
            queue: Arc<EventQueue<String>>,
            mut stop: watch::Receiver<bool>,
        ) {
            for item in self.items {
                queue.enqueue(item);
            }
            let _ = stop.changed().await;
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl NotificationSource<String> for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn sync(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("store unreachable")
        }

        async fn run(
            self: Box<Self>,
            _queue: Arc<EventQueue<String>>,
            mut stop: watch::Receiver<bool>,
        ) {
            let _ = stop.changed().await;
        }
    }

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl EventHandler<String> for Recorder {
        async fn handle(&self, object: &String) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("{}:{object}", self.tag));
            Ok(())
        }
    }

    struct FailOnce {
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait::async_trait]
    impl EventHandler<String> for FailOnce {
        async fn handle(&self, _object: &String) -> anyhow::Result<()> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                anyhow::bail!("transient failure")
            }
            Ok(())
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut controller = ResourceController::new();
        controller.on_added(Recorder {
            tag: "first",
            log: Arc::clone(&log),
        });
        controller.on_added(Recorder {
            tag: "second",
            log: Arc::clone(&log),
        });
        controller.add_source(Box::new(StaticSource {
            items: vec![WorkItem::new("default/a", Event::Added("a".to_string()))],
        }));

        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn(controller.run(1, stop_rx));

        wait_for(|| log.lock().unwrap().len() == 2).await;
        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first:a", "second:a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_error_requeues_and_reports() {
        let calls = Arc::new(Mutex::new(0));
        let mut controller = ResourceController::new();
        let mut errors = controller.take_errors().unwrap();
        controller.on_updated(FailOnce {
            calls: Arc::clone(&calls),
        });
        controller.add_source(Box::new(StaticSource {
            items: vec![WorkItem::new("default/a", Event::Updated("a".to_string()))],
        }));

        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn(controller.run(2, stop_rx));

        // first attempt fails and is retried under backoff
        wait_for(|| *calls.lock().unwrap() == 2).await;
        let reported = errors.recv().await.unwrap();
        assert!(matches!(reported, ControllerError::Handler { ref key, .. } if key == "default/a"));

        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_sync_is_fatal() {
        let mut controller = ResourceController::<String>::new();
        controller.add_source(Box::new(FailingSource));

        let (_stop_tx, stop_rx) = watch::channel(false);
        let result = controller.run(1, stop_rx).await;

        assert!(matches!(
            result,
            Err(ControllerError::InitialSync { ref source_name, .. }) if source_name == "failing"
        ));
    }
}
