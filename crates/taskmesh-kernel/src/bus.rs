//! Per-task event fan-out.
//!
//! Events travel as JSON envelopes over the shared cache's pub/sub
//! channel `task:<id>`. Each replica runs one [`EventBus`]: the first
//! local subscriber for a task opens the channel subscription at the
//! cache, later subscribers share it through a local broadcast, and the
//! last unsubscriber closes it: the refcount bookkeeping that keeps a
//! replica from holding thousands of idle channel subscriptions.
//!
//! Clients that registered a mailbox also get a copy of every envelope
//! pushed there with a TTL, so a brief disconnect loses nothing: on
//! reconnect the client drains its mailbox first, then resubscribes.
//! Overlapping reconnects can see one duplicate; consumers are expected
//! to be idempotent against repeated status messages.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::CacheService;
use crate::error::KernelResult;

/// The closed set of event kinds the bus carries. Payloads stay opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Log,
    Status,
    Progress,
    SubtaskQueued,
    CheckpointCreated,
    WorkerOffline,
    WorkerUpdate,
    TaskCancelled,
    TaskCompleted,
}

/// The wire envelope; the bus never interprets `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

struct LocalChannel {
    refcount: usize,
    sender: broadcast::Sender<Arc<EventEnvelope>>,
    pump: JoinHandle<()>,
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Per-replica subscription manager and publisher.
#[derive(Clone)]
pub struct EventBus {
    cache: CacheService,
    channels: Arc<DashMap<Uuid, LocalChannel>>,
    /// Clients with an active mailbox, per task.
    clients: Arc<DashMap<Uuid, HashSet<String>>>,
    mailbox_ttl: Duration,
}

impl EventBus {
    pub fn new(cache: CacheService, mailbox_ttl: Duration) -> Self {
        Self {
            cache,
            channels: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
            mailbox_ttl,
        }
    }

    fn channel_name(task_id: Uuid) -> String {
        format!("task:{task_id}")
    }

    /// Publish an envelope on the task's channel and copy it into every
    /// registered client mailbox. Returns the channel receiver count.
    pub async fn publish(&self, task_id: Uuid, envelope: &EventEnvelope) -> KernelResult<usize> {
        let payload = serde_json::to_vec(envelope)?;

        let receivers = self
            .cache
            .publish(&Self::channel_name(task_id), payload.clone())
            .await?;

        if let Some(clients) = self.clients.get(&task_id) {
            for client in clients.iter() {
                self.cache
                    .mailbox_push(client, payload.clone(), self.mailbox_ttl)
                    .await;
            }
        }

        trace!(task_id = %task_id, event = ?envelope.event_type, receivers, "event published");
        Ok(receivers)
    }

    /// Subscribe a local consumer to a task's events.
    ///
    /// The first subscriber opens the cache channel; the rest share it.
    /// Pair every call with [`EventBus::unsubscribe`].
    pub async fn subscribe(
        &self,
        task_id: Uuid,
    ) -> KernelResult<broadcast::Receiver<Arc<EventEnvelope>>> {
        if let Some(mut entry) = self.channels.get_mut(&task_id) {
            entry.refcount += 1;
            return Ok(entry.sender.subscribe());
        }

        // First local subscriber: open the upstream subscription before
        // publishing the local channel entry.
        let mut upstream = self.cache.subscribe(&Self::channel_name(task_id)).await?;
        let (sender, receiver) = broadcast::channel(256);
        let pump_sender = sender.clone();
        let pump = tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(message) => {
                        match serde_json::from_slice::<EventEnvelope>(&message.payload) {
                            Ok(envelope) => {
                                let _ = pump_sender.send(Arc::new(envelope));
                            }
                            Err(err) => {
                                warn!(%err, "dropping undecodable bus message");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "bus consumer lagged; events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        match self.channels.entry(task_id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                // Lost the race to another subscriber; reuse theirs.
                pump.abort();
                entry.get_mut().refcount += 1;
                Ok(entry.get().sender.subscribe())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(LocalChannel {
                    refcount: 1,
                    sender,
                    pump,
                });
                debug!(task_id = %task_id, "channel subscription opened");
                Ok(receiver)
            }
        }
    }

    /// Drop one local subscription; closes the cache channel when the
    /// last consumer leaves.
    pub fn unsubscribe(&self, task_id: Uuid) {
        let remove = match self.channels.get_mut(&task_id) {
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if remove {
            self.channels.remove(&task_id);
            debug!(task_id = %task_id, "channel subscription closed");
        }
    }

    /// Local subscriber count for a task.
    pub fn subscriber_count(&self, task_id: Uuid) -> usize {
        self.channels
            .get(&task_id)
            .map(|entry| entry.refcount)
            .unwrap_or(0)
    }

    /// Start buffering this task's events into the client's mailbox.
    pub fn register_client(&self, task_id: Uuid, client_id: &str) {
        self.clients
            .entry(task_id)
            .or_default()
            .insert(client_id.to_string());
    }

    /// Stop buffering for the client (terminal disconnect).
    pub fn deregister_client(&self, task_id: Uuid, client_id: &str) {
        if let Some(mut clients) = self.clients.get_mut(&task_id) {
            clients.remove(client_id);
        }
    }

    /// Atomically drain the client's mailbox into decoded envelopes.
    /// Call before resubscribing on reconnect.
    pub async fn drain_mailbox(&self, client_id: &str) -> Vec<EventEnvelope> {
        self.cache
            .mailbox_drain(client_id)
            .await
            .into_iter()
            .filter_map(|payload| match serde_json::from_slice(&payload) {
                Ok(envelope) => Some(envelope),
                Err(err) => {
                    warn!(%err, "dropping undecodable mailbox entry");
                    None
                }
            })
            .collect()
    }
}

// ── tests ────────────────────────────────────────────────────────────
