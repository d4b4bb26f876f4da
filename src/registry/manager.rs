//! Producer/consumer rendezvous for logical streams.

use crate::batch::SubscriptionFilter;
use crate::error::{Result, StreamError};
use crate::types::{ConsumerId, ProducerId, StreamId, SubscriptionId, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use super::notify::{LivenessCheck, ProducerNotifier};
use super::storage::SnapshotStore;
use super::types::{
    Liveness, NotifyError, ProducerKey, ProducerState, StreamActivity, StreamSnapshot,
    SubscriptionKey, SubscriptionState,
};

/// Per-stream state, loaded from storage on first use.
#[derive(Default)]
struct StreamEntry {
    loaded: bool,
    /// Dropped from the map while empty. Callers that were waiting on it
    /// look the stream up again.
    retired: bool,
    snapshot: StreamSnapshot,
}

/// Outcome of fanning a notification out to every producer.
#[derive(Default)]
struct FanOut {
    gone: Vec<ProducerId>,
    failures: Vec<String>,
}

/// Tracks producers and subscribers per stream and keeps them in touch.
///
/// Mutations on one stream are serialized: the stream's lock is held across
/// persistence and producer notification, so a call returns only after
/// storage has acknowledged it. Different streams proceed independently.
pub struct SubscriptionRegistry {
    store: Arc<dyn SnapshotStore>,
    notifier: Arc<dyn ProducerNotifier>,
    liveness: Arc<dyn LivenessCheck>,
    streams: Mutex<HashMap<StreamId, Arc<Mutex<StreamEntry>>>>,
}

impl SubscriptionRegistry {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        notifier: Arc<dyn ProducerNotifier>,
        liveness: Arc<dyn LivenessCheck>,
    ) -> Self {
        Self {
            store,
            notifier,
            liveness,
            streams: Mutex::new(HashMap::new()),
        }
    }

    // --- Producers ---

    /// Register a producer and return the subscriptions it should serve.
    ///
    /// Fails with `InvalidProducer` unless the producer is reported active.
    pub fn register_producer(
        &self,
        stream: &StreamId,
        producer: &ProducerId,
    ) -> Result<Vec<SubscriptionState>> {
        if self.liveness.is_alive(producer) != Liveness::Active {
            return Err(StreamError::InvalidProducer {
                stream: stream.clone(),
                producer: producer.clone(),
            });
        }

        self.with_stream(stream, |snapshot| {
            let mut next = snapshot.clone();
            self.prune_dead_producers(stream, &mut next);

            let key = ProducerKey {
                stream: stream.clone(),
                producer: producer.clone(),
            };
            next.producers.insert(
                key,
                ProducerState {
                    stream: stream.clone(),
                    producer: producer.clone(),
                    registered_at: Timestamp::now(),
                },
            );
            self.commit(stream, snapshot, next)?;

            info!(%stream, %producer, producers = snapshot.producers.len(), "producer registered");
            Ok(snapshot.active_subscriptions().cloned().collect())
        })
    }

    /// Remove a producer. Returns `Idle` once the stream has no registrations
    /// left, in which case its durable state has been cleared.
    pub fn unregister_producer(
        &self,
        stream: &StreamId,
        producer: &ProducerId,
    ) -> Result<StreamActivity> {
        self.with_stream(stream, |snapshot| {
            let key = ProducerKey {
                stream: stream.clone(),
                producer: producer.clone(),
            };
            if !snapshot.producers.contains_key(&key) {
                debug!(%stream, %producer, "unregister of unknown producer");
                return Ok(Self::activity(snapshot));
            }

            let mut next = snapshot.clone();
            next.producers.remove(&key);
            let activity = self.commit(stream, snapshot, next)?;
            info!(%stream, %producer, "producer unregistered");
            Ok(activity)
        })
    }

    // --- Consumers ---

    /// Create or update a subscription and tell every producer about it.
    ///
    /// Registering the same consumer and filter again is a no-op. Producers
    /// that report themselves gone are pruned; any other notification
    /// failure is returned once every producer has been tried.
    ///
    /// A producer whose notification failed is not retried by registering
    /// again. It picks the subscription up when it next calls
    /// [`register_producer`](Self::register_producer).
    pub fn register_consumer(
        &self,
        stream: &StreamId,
        subscription_id: SubscriptionId,
        consumer: &ConsumerId,
        filter: Option<SubscriptionFilter>,
    ) -> Result<()> {
        self.with_stream(stream, |snapshot| {
            let key = SubscriptionKey {
                stream: stream.clone(),
                subscription: subscription_id,
            };

            let created_at = match snapshot.consumers.get(&key) {
                Some(existing) if existing.faulted => {
                    return Err(StreamError::FaultedSubscription {
                        stream: stream.clone(),
                        subscription: subscription_id,
                    });
                }
                Some(existing) if &existing.consumer == consumer && existing.filter == filter => {
                    debug!(%stream, subscription = %subscription_id, "subscription unchanged");
                    return Ok(());
                }
                Some(existing) => existing.created_at,
                None => Timestamp::now(),
            };

            let mut next = snapshot.clone();
            self.prune_dead_producers(stream, &mut next);

            let subscription = SubscriptionState {
                subscription_id,
                stream: stream.clone(),
                consumer: consumer.clone(),
                filter,
                faulted: false,
                created_at,
            };
            next.consumers.insert(key, subscription.clone());
            self.commit(stream, snapshot, next)?;
            info!(%stream, subscription = %subscription_id, %consumer, "consumer registered");

            let outcome = self.fan_out(snapshot.producer_ids(), |producer| {
                self.notifier.add_subscriber(producer, &subscription)
            });
            self.settle(stream, snapshot, outcome, "adding subscriber", subscription_id)
                .map(|_| ())
        })
    }

    /// Remove a subscription and tell producers to stop delivering to it.
    pub fn unregister_consumer(
        &self,
        stream: &StreamId,
        subscription_id: SubscriptionId,
    ) -> Result<StreamActivity> {
        self.with_stream(stream, |snapshot| {
            let key = SubscriptionKey {
                stream: stream.clone(),
                subscription: subscription_id,
            };
            match snapshot.consumers.get(&key) {
                Some(existing) if existing.faulted => {
                    return Err(StreamError::FaultedSubscription {
                        stream: stream.clone(),
                        subscription: subscription_id,
                    });
                }
                Some(_) => {}
                None => {
                    debug!(%stream, subscription = %subscription_id, "unregister of unknown subscription");
                    return Ok(Self::activity(snapshot));
                }
            }

            let mut next = snapshot.clone();
            next.consumers.remove(&key);
            self.prune_dead_producers(stream, &mut next);
            let activity = self.commit(stream, snapshot, next)?;
            info!(%stream, subscription = %subscription_id, "consumer unregistered");

            let outcome = self.fan_out(snapshot.producer_ids(), |producer| {
                self.notifier
                    .remove_subscriber(producer, stream, subscription_id)
            });
            if outcome.gone.is_empty() && outcome.failures.is_empty() {
                return Ok(activity);
            }
            self.settle(stream, snapshot, outcome, "removing subscriber", subscription_id)
        })
    }

    /// Permanently disable a subscription after an unrecoverable delivery
    /// failure. Unknown or already-faulted subscriptions are left alone.
    pub fn fault_subscription(
        &self,
        stream: &StreamId,
        subscription_id: SubscriptionId,
    ) -> Result<()> {
        self.with_stream(stream, |snapshot| {
            let key = SubscriptionKey {
                stream: stream.clone(),
                subscription: subscription_id,
            };
            let mut next = snapshot.clone();
            match next.consumers.get_mut(&key) {
                Some(existing) if !existing.faulted => existing.faulted = true,
                _ => return Ok(()),
            }

            self.prune_dead_producers(stream, &mut next);
            self.commit(stream, snapshot, next)?;
            warn!(%stream, subscription = %subscription_id, "subscription faulted");

            let outcome = self.fan_out(snapshot.producer_ids(), |producer| {
                self.notifier
                    .remove_subscriber(producer, stream, subscription_id)
            });
            self.settle(stream, snapshot, outcome, "dropping faulted subscriber", subscription_id)
                .map(|_| ())
        })
    }

    // --- Queries ---

    pub fn producer_count(&self, stream: &StreamId) -> Result<usize> {
        self.with_stream(stream, |snapshot| Ok(snapshot.producers.len()))
    }

    /// Subscriptions that have not faulted.
    pub fn consumer_count(&self, stream: &StreamId) -> Result<usize> {
        self.with_stream(stream, |snapshot| Ok(snapshot.active_subscriptions().count()))
    }

    /// Non-faulted subscriptions on `stream`, optionally only those of `consumer`.
    pub fn subscriptions(
        &self,
        stream: &StreamId,
        consumer: Option<&ConsumerId>,
    ) -> Result<Vec<SubscriptionState>> {
        self.with_stream(stream, |snapshot| {
            let mut subscriptions: Vec<SubscriptionState> = snapshot
                .active_subscriptions()
                .filter(|s| consumer.map_or(true, |c| &s.consumer == c))
                .cloned()
                .collect();
            subscriptions.sort_by_key(|s| s.subscription_id);
            Ok(subscriptions)
        })
    }

    pub fn is_faulted(&self, stream: &StreamId, subscription_id: SubscriptionId) -> Result<bool> {
        self.with_stream(stream, |snapshot| {
            let key = SubscriptionKey {
                stream: stream.clone(),
                subscription: subscription_id,
            };
            Ok(snapshot.consumers.get(&key).is_some_and(|s| s.faulted))
        })
    }

    // --- Internals ---

    /// Run `f` with the stream's state locked, loading it first if needed.
    ///
    /// A stream left empty afterwards is dropped from memory, so idle and
    /// query-only streams cost nothing once the call returns.
    fn with_stream<T>(
        &self,
        stream: &StreamId,
        f: impl FnOnce(&mut StreamSnapshot) -> Result<T>,
    ) -> Result<T> {
        loop {
            let handle = {
                let mut streams = self.streams.lock();
                Arc::clone(streams.entry(stream.clone()).or_default())
            };

            let mut entry = handle.lock();
            if entry.retired {
                continue;
            }

            let result = match self.load_entry(stream, &mut entry) {
                Ok(()) => f(&mut entry.snapshot),
                Err(e) => Err(e),
            };

            if entry.snapshot.is_empty() {
                // Entry lock is held, so nobody can repopulate it meanwhile
                let mut streams = self.streams.lock();
                if streams.get(stream).is_some_and(|e| Arc::ptr_eq(e, &handle)) {
                    streams.remove(stream);
                }
                entry.retired = true;
            }
            return result;
        }
    }

    fn load_entry(&self, stream: &StreamId, entry: &mut StreamEntry) -> Result<()> {
        if entry.loaded {
            return Ok(());
        }
        entry.snapshot = self.store.load(stream)?.unwrap_or_default();
        entry.loaded = true;
        debug!(
            %stream,
            producers = entry.snapshot.producers.len(),
            consumers = entry.snapshot.consumers.len(),
            "loaded rendezvous state"
        );
        Ok(())
    }

    /// Drop producers the liveness check reports dead. `Unknown` is kept.
    fn prune_dead_producers(&self, stream: &StreamId, snapshot: &mut StreamSnapshot) {
        snapshot.producers.retain(|_, p| {
            let dead = self.liveness.is_alive(&p.producer) == Liveness::Dead;
            if dead {
                warn!(%stream, producer = %p.producer, "pruning dead producer");
            }
            !dead
        });
    }

    fn activity(snapshot: &StreamSnapshot) -> StreamActivity {
        if snapshot.is_empty() {
            StreamActivity::Idle
        } else {
            StreamActivity::Active
        }
    }

    /// Make `next` durable, then current. Clears durable state instead when
    /// nothing is left. On failure the in-memory state is untouched.
    fn commit(
        &self,
        stream: &StreamId,
        snapshot: &mut StreamSnapshot,
        next: StreamSnapshot,
    ) -> Result<StreamActivity> {
        let activity = Self::activity(&next);
        match activity {
            StreamActivity::Idle => self.store.clear(stream)?,
            StreamActivity::Active => self.store.save(stream, &next)?,
        }
        *snapshot = next;
        if activity == StreamActivity::Idle {
            info!(%stream, "stream idle");
        }
        Ok(activity)
    }

    /// Call `notify` for every producer concurrently and wait for all.
    fn fan_out<F>(&self, producers: Vec<ProducerId>, notify: F) -> FanOut
    where
        F: Fn(&ProducerId) -> std::result::Result<(), NotifyError> + Sync,
    {
        let notify = &notify;
        let results: Vec<(ProducerId, std::result::Result<(), NotifyError>)> =
            if producers.len() <= 1 {
                producers
                    .into_iter()
                    .map(|p| {
                        let result = notify(&p);
                        (p, result)
                    })
                    .collect()
            } else {
                thread::scope(|scope| {
                    let handles: Vec<_> = producers
                        .iter()
                        .map(|p| scope.spawn(move || notify(p)))
                        .collect();
                    producers
                        .iter()
                        .cloned()
                        .zip(handles)
                        .map(|(p, handle)| {
                            let result = handle.join().unwrap_or_else(|_| {
                                Err(NotifyError::Failed("notification panicked".into()))
                            });
                            (p, result)
                        })
                        .collect()
                })
            };

        let mut outcome = FanOut::default();
        for (producer, result) in results {
            match result {
                Ok(()) => {}
                Err(NotifyError::Gone) => outcome.gone.push(producer),
                Err(NotifyError::Failed(message)) => {
                    outcome.failures.push(format!("{}: {}", producer, message))
                }
            }
        }
        outcome
    }

    /// Prune gone producers (re-saving state) and surface remaining failures.
    fn settle(
        &self,
        stream: &StreamId,
        snapshot: &mut StreamSnapshot,
        outcome: FanOut,
        action: &str,
        subscription_id: SubscriptionId,
    ) -> Result<StreamActivity> {
        let mut activity = Self::activity(snapshot);
        if !outcome.gone.is_empty() {
            let mut next = snapshot.clone();
            for producer in &outcome.gone {
                warn!(%stream, %producer, "producer gone during notification, pruning");
                next.producers.remove(&ProducerKey {
                    stream: stream.clone(),
                    producer: producer.clone(),
                });
            }
            activity = self.commit(stream, snapshot, next)?;
        }

        if outcome.failures.is_empty() {
            return Ok(activity);
        }
        warn!(
            %stream,
            subscription = %subscription_id,
            failed = outcome.failures.len(),
            "producer notification failed"
        );
        Err(StreamError::collaborator(
            format!("{} {} on {}", action, subscription_id, stream),
            outcome.failures.join("; "),
        ))
    }
}
