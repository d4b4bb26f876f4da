//! Fixed-period polling thread.

use crate::batch::EventFilter;
use crate::cache::{Cursor, MessageCache};
use crate::error::Result;
use crate::types::{SequenceToken, StreamId};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::ingest::{cursor_for, PollReport, QueueReceiver};

/// Drives a [`QueueReceiver`] on its own thread.
///
/// Polls never overlap: the next one starts `interval` after the previous one
/// started, or immediately if the previous one overran.
pub struct PollingAgent {
    cache: MessageCache,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<QueueReceiver>>,
    last_report: Arc<Mutex<Option<PollReport>>>,
    polls: Arc<AtomicU64>,
}

impl PollingAgent {
    /// Start polling `receiver` every `interval`.
    pub fn spawn(receiver: QueueReceiver, interval: Duration) -> Result<Self> {
        let cache = receiver.cache().clone();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let last_report = Arc::new(Mutex::new(None));
        let polls = Arc::new(AtomicU64::new(0));

        let thread_report = Arc::clone(&last_report);
        let thread_polls = Arc::clone(&polls);
        let handle = thread::Builder::new()
            .name("stream-relay-poll".into())
            .spawn(move || {
                let mut receiver = receiver;
                loop {
                    let started = Instant::now();
                    let report = receiver.poll();
                    *thread_report.lock() = Some(report);
                    thread_polls.fetch_add(1, Ordering::Release);

                    let wait = interval.saturating_sub(started.elapsed());
                    match shutdown_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("polling agent stopped");
                receiver
            })?;

        Ok(Self {
            cache,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            last_report,
            polls,
        })
    }

    /// Attach a subscriber to the receiver's cache.
    pub fn create_cursor(
        &self,
        stream: StreamId,
        token: Option<SequenceToken>,
        filter: Option<Arc<dyn EventFilter>>,
    ) -> Cursor {
        cursor_for(&self.cache, stream, token, filter)
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Report of the most recent completed poll.
    pub fn last_report(&self) -> Option<PollReport> {
        self.last_report.lock().clone()
    }

    /// Polls completed so far.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Acquire)
    }

    /// Stop polling and hand the receiver back.
    pub fn shutdown(mut self) -> Option<QueueReceiver> {
        self.stop()
    }

    fn stop(&mut self) -> Option<QueueReceiver> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.try_send(());
        }
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(receiver) => Some(receiver),
            Err(_) => {
                warn!("polling thread panicked");
                None
            }
        }
    }
}

impl Drop for PollingAgent {
    fn drop(&mut self) {
        self.stop();
    }
}
