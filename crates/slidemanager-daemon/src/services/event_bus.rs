//! Per-job bounded event stream with drop-oldest overflow.
//!
//! Publishing never blocks: each job gets a bounded broadcast channel, and a
//! subscriber that falls behind skips the dropped span and picks up at the
//! most recent event. Sequence numbers are job-local, assigned at publish
//! time, and strictly increasing (gaps are possible after drops, reordering
//! is not).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub ts: i64,
    pub seq: u64,
    pub job_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

struct JobChannel {
    tx: broadcast::Sender<Event>,
    next_seq: u64,
}

pub struct EventBus {
    capacity: usize,
    jobs: Mutex<HashMap<String, JobChannel>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event for a job, assigning the next sequence number. The
    /// returned event is what subscribers observe. Never blocks; with no
    /// subscriber the event is only retained in the ring.
    pub fn publish(
        &self,
        job_id: &str,
        kind: &str,
        payload: serde_json::Value,
        ts: i64,
    ) -> Event {
        debug_assert!(!job_id.is_empty());
        debug_assert!(!kind.is_empty());

        let mut jobs = self.lock();
        let capacity = self.capacity;
        let channel = jobs
            .entry(job_id.to_string())
            .or_insert_with(|| JobChannel {
                tx: broadcast::channel(capacity).0,
                next_seq: 0,
            });
        channel.next_seq += 1;
        let event = Event {
            ts,
            seq: channel.next_seq,
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            payload,
        };
        // Send fails only when nobody is subscribed yet; the durable event
        // row is the replayable record, so that is not an error here.
        let _ = channel.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<Event> {
        let mut jobs = self.lock();
        let capacity = self.capacity;
        jobs.entry(job_id.to_string())
            .or_insert_with(|| JobChannel {
                tx: broadcast::channel(capacity).0,
                next_seq: 0,
            })
            .tx
            .subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobChannel>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Render one event as a server-sent-events frame.
pub fn sse_format(event: &Event) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}
