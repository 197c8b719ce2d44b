//! Message counters backing the broker-local `RPCGetMessageStats` and
//! `RPCGetMessageCount` RPC methods.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default, Serialize, Clone)]
pub struct ProcessMessageStats {
    pub sent: u64,
    pub received: u64,
    pub first_message_time: Option<i64>,
    pub last_message_time: Option<i64>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

#[derive(Default)]
struct Timestamps {
    first: Option<i64>,
    last: Option<i64>,
}

/// One instance owned by the router; updated on every routed message.
pub struct MessageStats {
    total: Counters,
    total_times: Mutex<Timestamps>,
    per_process: Mutex<HashMap<String, (Counters, Timestamps)>>,
}

impl Default for MessageStats {
    fn default() -> Self {
        Self {
            total: Counters::default(),
            total_times: Mutex::new(Timestamps::default()),
            per_process: Mutex::new(HashMap::new()),
        }
    }
}

impl MessageStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(times: &mut Timestamps, now: i64) {
        if times.first.is_none() {
            times.first = Some(now);
        }
        times.last = Some(now);
    }

    pub fn record_sent(&self, process_id: &str) {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        self.total.sent.fetch_add(1, Ordering::Relaxed);
        Self::touch(&mut self.total_times.lock().unwrap(), now);

        let mut per = self.per_process.lock().unwrap();
        let entry = per.entry(process_id.to_string()).or_default();
        entry.0.sent.fetch_add(1, Ordering::Relaxed);
        Self::touch(&mut entry.1, now);
    }

    pub fn record_received(&self, process_id: &str) {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        self.total.received.fetch_add(1, Ordering::Relaxed);
        Self::touch(&mut self.total_times.lock().unwrap(), now);

        let mut per = self.per_process.lock().unwrap();
        let entry = per.entry(process_id.to_string()).or_default();
        entry.0.received.fetch_add(1, Ordering::Relaxed);
        Self::touch(&mut entry.1, now);
    }

    pub fn total_count(&self) -> u64 {
        self.total.sent.load(Ordering::Relaxed) + self.total.received.load(Ordering::Relaxed)
    }

    pub fn total_stats(&self) -> ProcessMessageStats {
        let times = self.total_times.lock().unwrap();
        ProcessMessageStats {
            sent: self.total.sent.load(Ordering::Relaxed),
            received: self.total.received.load(Ordering::Relaxed),
            first_message_time: times.first,
            last_message_time: times.last,
        }
    }

    pub fn per_process_stats(&self) -> HashMap<String, ProcessMessageStats> {
        self.per_process
            .lock()
            .unwrap()
            .iter()
            .map(|(pid, (counters, times))| {
                (
                    pid.clone(),
                    ProcessMessageStats {
                        sent: counters.sent.load(Ordering::Relaxed),
                        received: counters.received.load(Ordering::Relaxed),
                        first_message_time: times.first,
                        last_message_time: times.last,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_process_and_total() {
        let stats = MessageStats::new();
        stats.record_sent("a");
        stats.record_received("a");
        stats.record_received("b");

        assert_eq!(stats.total_count(), 3);
        let per = stats.per_process_stats();
        assert_eq!(per["a"].sent, 1);
        assert_eq!(per["a"].received, 1);
        assert_eq!(per["b"].received, 1);
        assert!(stats.total_stats().first_message_time.is_some());
    }
}
