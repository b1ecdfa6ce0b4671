use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::Stream;
use log::debug;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::errors::IntakeError;

const DEDUP_CAPACITY: usize = 1000;
const FRESHNESS_WINDOW_SECONDS: i64 = 300;

/// One raw event from a chat surface or other adapter. Adapters only need to
/// produce this tuple; everything beyond it is out of the core's hands.
#[derive(Deserialize, Debug, Clone)]
pub struct InboundEvent {
    pub event_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub channel: String,
    pub user: String,
    pub body: String,
}

/// Front door for inbound requests: validates addressing, drops stale and
/// duplicate events, and admits at most one orchestration at a time.
pub struct EventIntake {
    mention_token: String,
    seen: Mutex<SeenWindow>,
    in_flight: Arc<AtomicBool>,
}

struct SeenWindow {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl EventIntake {
    pub fn new(mention_token: impl Into<String>) -> Self {
        Self {
            mention_token: mention_token.into(),
            seen: Mutex::new(SeenWindow {
                ids: HashSet::with_capacity(DEDUP_CAPACITY),
                order: VecDeque::with_capacity(DEDUP_CAPACITY),
            }),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Decides whether an event reaches the orchestrator. Returns the message
    /// body with the mention token stripped.
    ///
    /// The freshness filter is load-bearing: surfaces re-deliver their backlog
    /// on reconnect, and without it a restart replays every queued request.
    pub fn admit(&self, event: &InboundEvent, now: OffsetDateTime) -> Result<String, IntakeError> {
        let body = event.body.trim();
        if body.is_empty() {
            return Err(IntakeError::EmptyBody);
        }
        let Some(message) = body.strip_prefix(&self.mention_token) else {
            return Err(IntakeError::NotAddressed);
        };
        let message = message.trim();
        if message.is_empty() {
            return Err(IntakeError::EmptyBody);
        }

        let age = now - event.timestamp;
        if age > Duration::seconds(FRESHNESS_WINDOW_SECONDS) {
            return Err(IntakeError::Stale {
                age_seconds: age.whole_seconds(),
            });
        }

        if !self.record_event_id(&event.event_id) {
            return Err(IntakeError::Duplicate {
                event_id: event.event_id.clone(),
            });
        }

        Ok(message.to_string())
    }

    /// Single-in-flight gate. The returned guard must live for the whole
    /// orchestration; dropping it reopens the gate.
    pub fn begin_run(&self) -> Result<InFlightGuard, IntakeError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IntakeError::Busy);
        }
        Ok(InFlightGuard {
            flag: Arc::clone(&self.in_flight),
        })
    }

    /// Returns false for ids already inside the bounded window. The window
    /// evicts oldest-first at capacity.
    fn record_event_id(&self, event_id: &str) -> bool {
        let mut seen = self.seen.lock().expect("dedup window poisoned");
        if seen.ids.contains(event_id) {
            return false;
        }
        if seen.order.len() >= DEDUP_CAPACITY {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        seen.ids.insert(event_id.to_string());
        seen.order.push_back(event_id.to_string());
        true
    }
}

pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Newline-delimited JSON events from stdin, one `InboundEvent` per line.
/// Unparseable lines are logged and skipped so one bad adapter message can't
/// wedge the loop.
pub fn stdin_events() -> impl Stream<Item = InboundEvent> {
    async_stream::stream! {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<InboundEvent>(line) {
                Ok(event) => yield event,
                Err(error) => debug!("skipping unparseable event: {error}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, body: &str, age_seconds: i64) -> InboundEvent {
        InboundEvent {
            event_id: id.to_string(),
            timestamp: OffsetDateTime::now_utc() - Duration::seconds(age_seconds),
            channel: "#qa".to_string(),
            user: "dana".to_string(),
            body: body.to_string(),
        }
    }

    fn intake() -> EventIntake {
        EventIntake::new("@testgpt")
    }

    #[test]
    fn admits_an_addressed_fresh_event() {
        let intake = intake();
        let now = OffsetDateTime::now_utc();
        let message = intake
            .admit(&event("e1", "@testgpt test example.com on iphone", 5), now)
            .unwrap();
        assert_eq!(message, "test example.com on iphone");
    }

    #[test]
    fn duplicate_ids_are_dropped() {
        let intake = intake();
        let now = OffsetDateTime::now_utc();
        let e = event("e1", "@testgpt test example.com", 1);
        assert!(intake.admit(&e, now).is_ok());
        assert!(matches!(
            intake.admit(&e, now),
            Err(IntakeError::Duplicate { .. })
        ));
    }

    #[test]
    fn dedup_window_evicts_oldest() {
        let intake = intake();
        let now = OffsetDateTime::now_utc();
        for index in 0..DEDUP_CAPACITY {
            let e = event(&format!("e{index}"), "@testgpt test example.com", 1);
            intake.admit(&e, now).unwrap();
        }
        // e0 has been evicted, so the same id is admitted again.
        let replay = event("e0", "@testgpt test example.com", 1);
        assert!(intake.admit(&replay, now).is_ok());
    }

    #[test]
    fn stale_events_are_dropped() {
        let intake = intake();
        let now = OffsetDateTime::now_utc();
        let e = event("e1", "@testgpt test example.com", FRESHNESS_WINDOW_SECONDS + 10);
        assert!(matches!(intake.admit(&e, now), Err(IntakeError::Stale { .. })));
    }

    #[test]
    fn unaddressed_and_empty_events_are_rejected() {
        let intake = intake();
        let now = OffsetDateTime::now_utc();
        assert!(matches!(
            intake.admit(&event("e1", "test example.com", 1), now),
            Err(IntakeError::NotAddressed)
        ));
        assert!(matches!(
            intake.admit(&event("e2", "   ", 1), now),
            Err(IntakeError::EmptyBody)
        ));
        assert!(matches!(
            intake.admit(&event("e3", "@testgpt   ", 1), now),
            Err(IntakeError::EmptyBody)
        ));
    }

    #[test]
    fn only_one_run_at_a_time() {
        let intake = intake();
        let guard = intake.begin_run().unwrap();
        assert!(matches!(intake.begin_run(), Err(IntakeError::Busy)));
        drop(guard);
        assert!(intake.begin_run().is_ok());
    }

    #[test]
    fn event_json_roundtrip() {
        let line = r##"{"event_id":"e9","timestamp":"2026-08-01T10:00:00Z","channel":"#qa","user":"dana","body":"@testgpt test example.com"}"##;
        let event: InboundEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.event_id, "e9");
        assert_eq!(event.channel, "#qa");
    }
}
