/*!
In-process monitoring fan-out.

The readout processor publishes synchronisation events (timecode received,
housekeeping decoded, files ready, ...) that other components consume to
align themselves with the readout cycle. Publishing is fire-and-forget: a
slow subscriber loses events instead of stalling the readout loop.
*/

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::Value;
use tracing::debug;

/// Capacity of each subscriber channel
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

/// The event classes published by the readout processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringTopic {
    /// A timecode was received, payload `{ "timecode": u8 }`
    SyncTimecode,
    /// A housekeeping packet was received, payload holds the decoded type field
    SyncHkPacket,
    /// Updated housekeeping was read, payload `{ "error_flags", "frame_counter" }`
    SyncErrorFlags,
    /// Updated housekeeping raw data, hex encoded
    SyncHkData,
    /// The remaining cycle count at the start of a new cycle
    NumCycles,
    /// Filenames of the previous cycle registration, ready for processing
    FilesReady,
    /// A register map snapshot, hex encoded
    RegisterMap,
    /// A data packet was received, payload holds the decoded type field
    SyncDataPacket,
}

/// One published monitoring event
#[derive(Debug, Clone)]
pub struct MonitoringEvent {
    pub topic: MonitoringTopic,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    topics: Option<Vec<MonitoringTopic>>,
    tx: Sender<MonitoringEvent>,
    dropped: u64,
}

#[derive(Default)]
struct HubInner {
    subscribers: Vec<Subscriber>,
}

/// Cloneable pub-sub hub for monitoring events
#[derive(Clone, Default)]
pub struct MonitoringHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MonitoringHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a set of topics
    pub fn subscribe(&self, topics: &[MonitoringTopic]) -> Receiver<MonitoringEvent> {
        self.add_subscriber(Some(topics.to_vec()))
    }

    /// Subscribe to every topic
    pub fn subscribe_all(&self) -> Receiver<MonitoringEvent> {
        self.add_subscriber(None)
    }

    fn add_subscriber(&self, topics: Option<Vec<MonitoringTopic>>) -> Receiver<MonitoringEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.push(Subscriber {
            topics,
            tx,
            dropped: 0,
        });
        rx
    }

    /// Publish an event to all matching subscribers. Never blocks; events
    /// for full or disconnected subscribers are dropped.
    pub fn publish(&self, topic: MonitoringTopic, payload: Value) {
        let event = MonitoringEvent {
            topic,
            payload,
            timestamp: Utc::now(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain_mut(|sub| {
            let wants = match &sub.topics {
                Some(topics) => topics.contains(&topic),
                None => true,
            };
            if !wants {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    sub.dropped += 1;
                    if sub.dropped % 100 == 1 {
                        debug!(
                            "slow monitoring subscriber, dropped {} events so far",
                            sub.dropped
                        );
                    }
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_filtering() {
        let hub = MonitoringHub::new();
        let timecodes = hub.subscribe(&[MonitoringTopic::SyncTimecode]);
        let everything = hub.subscribe_all();

        hub.publish(MonitoringTopic::SyncTimecode, json!({"timecode": 5}));
        hub.publish(MonitoringTopic::NumCycles, json!(3));

        let event = timecodes.try_recv().unwrap();
        assert_eq!(event.topic, MonitoringTopic::SyncTimecode);
        assert!(timecodes.try_recv().is_err());

        assert_eq!(everything.try_recv().unwrap().topic, MonitoringTopic::SyncTimecode);
        assert_eq!(everything.try_recv().unwrap().topic, MonitoringTopic::NumCycles);
    }

    #[test]
    fn test_disconnected_subscriber_is_removed() {
        let hub = MonitoringHub::new();
        let rx = hub.subscribe_all();
        drop(rx);

        // must not block or fail
        hub.publish(MonitoringTopic::NumCycles, json!(0));
    }

    #[test]
    fn test_full_subscriber_drops_events() {
        let hub = MonitoringHub::new();
        let rx = hub.subscribe(&[MonitoringTopic::NumCycles]);

        for i in 0..(super::SUBSCRIBER_CHANNEL_CAPACITY + 10) {
            hub.publish(MonitoringTopic::NumCycles, json!(i));
        }

        // the channel holds the first events, the overflow was dropped
        assert_eq!(rx.try_recv().unwrap().payload, json!(0));
    }
}
