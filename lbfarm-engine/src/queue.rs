//! In-process work queues wiring the orchestrator to its consumers.
//!
//! Senders are cheap clones handed to producers; each receiver is consumed
//! once by attaching an async handler. Delivery is at-most-once within the
//! process: a dropped message is logged, never retried, and the next
//! scheduled sync re-derives whatever work was lost.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use lbfarm_core::{Entity, EntityKind, Farm};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

const QUEUE_CAPACITY: usize = 1024;

/// Sending half of a named work queue.
pub struct Queue<T> {
    name: Arc<str>,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Queue<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue without blocking. A full or closed queue drops the message;
    /// the periodic sync re-derives lost work.
    pub fn send(&self, message: T) {
        if let Err(e) = self.tx.try_send(message) {
            error!("queue {}: message dropped ({})", self.name, e);
        }
    }
}

/// Receiving half, consumed exactly once via [`attach`](Self::attach).
pub struct QueueReceiver<T> {
    name: Arc<str>,
    rx: mpsc::Receiver<T>,
}

impl<T: Send + 'static> QueueReceiver<T> {
    /// Spawn a task that feeds every message to `handler`, one at a time,
    /// until all senders are gone.
    pub fn attach<F, Fut>(mut self, handler: F) -> JoinHandle<()>
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(message) = self.rx.recv().await {
                handler(message).await;
            }
            debug!("queue {}: consumer stopped", self.name);
        })
    }
}

pub fn queue<T: Send + 'static>(name: &str) -> (Queue<T>, QueueReceiver<T>) {
    let name: Arc<str> = Arc::from(name);
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (
        Queue { name: name.clone(), tx },
        QueueReceiver { name, rx },
    )
}

/// Farm-level queues: one per orchestrator operation.
#[derive(Clone)]
pub struct FarmQueues {
    pub sync: Queue<Farm>,
    pub create: Queue<Farm>,
    pub remove: Queue<Farm>,
    pub reload: Queue<Farm>,
    pub callback: Queue<Farm>,
}

pub struct FarmQueueReceivers {
    pub sync: QueueReceiver<Farm>,
    pub create: QueueReceiver<Farm>,
    pub remove: QueueReceiver<Farm>,
    pub reload: QueueReceiver<Farm>,
    pub callback: QueueReceiver<Farm>,
}

pub fn farm_queues() -> (FarmQueues, FarmQueueReceivers) {
    let (sync, sync_rx) = queue("farm.sync");
    let (create, create_rx) = queue("farm.create");
    let (remove, remove_rx) = queue("farm.remove");
    let (reload, reload_rx) = queue("farm.reload");
    let (callback, callback_rx) = queue("farm.callback");
    (
        FarmQueues { sync, create, remove, reload, callback },
        FarmQueueReceivers {
            sync: sync_rx,
            create: create_rx,
            remove: remove_rx,
            reload: reload_rx,
            callback: callback_rx,
        },
    )
}

/// Entity-level queues for one kind.
#[derive(Clone)]
pub struct EntityQueues {
    pub create: Queue<Entity>,
    pub update: Queue<Entity>,
    pub remove: Queue<Entity>,
}

pub struct EntityQueueReceivers {
    pub create: QueueReceiver<Entity>,
    pub update: QueueReceiver<Entity>,
    pub remove: QueueReceiver<Entity>,
}

pub fn entity_queues(kind: EntityKind) -> (EntityQueues, EntityQueueReceivers) {
    let (create, create_rx) = queue(&format!("{}.create", kind));
    let (update, update_rx) = queue(&format!("{}.update", kind));
    let (remove, remove_rx) = queue(&format!("{}.remove", kind));
    (
        EntityQueues { create, update, remove },
        EntityQueueReceivers {
            create: create_rx,
            update: update_rx,
            remove: remove_rx,
        },
    )
}

/// One [`EntityQueues`] per kind, as handed to the orchestrator.
pub fn all_entity_queues() -> (
    HashMap<EntityKind, EntityQueues>,
    Vec<(EntityKind, EntityQueueReceivers)>,
) {
    let mut senders = HashMap::new();
    let mut receivers = Vec::new();
    for kind in EntityKind::ALL {
        let (queues, rx) = entity_queues(kind);
        senders.insert(kind, queues);
        receivers.push((kind, rx));
    }
    (senders, receivers)
}
