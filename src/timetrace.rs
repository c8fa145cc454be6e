//! A low-overhead event trace for offline performance analysis.
//!
//! Every thread writes into its own fixed-capacity ring buffer, overwriting the oldest record
//!  once the buffer is full. A thread's buffer is registered with the trace on its first record
//!  and cached in a thread local afterwards, so threads never contend with each other while
//!  recording. The buffers are merged by timestamp when a report is requested.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// this thread's buffers, keyed by trace id
    static THREAD_BUFFERS: RefCell<FxHashMap<u64, Arc<Mutex<TraceBuffer>>>> = RefCell::new(FxHashMap::default());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    /// time since the trace was created
    pub timestamp: Duration,
    pub format: &'static str,
    pub args: [u32; 4],
}

impl TraceRecord {
    /// The record's message with `{}` placeholders replaced by the arguments in order
    pub fn message(&self) -> String {
        let mut result = String::with_capacity(self.format.len() + 16);
        let mut args = self.args.iter();
        let mut parts = self.format.split("{}").peekable();
        while let Some(part) = parts.next() {
            result.push_str(part);
            if parts.peek().is_some() {
                match args.next() {
                    Some(a) => result.push_str(&a.to_string()),
                    None => result.push_str("{}"),
                }
            }
        }
        result
    }
}

#[derive(Debug)]
struct TraceBuffer {
    records: Vec<TraceRecord>,
    next: usize,
}

impl TraceBuffer {
    fn push(&mut self, record: TraceRecord, capacity: usize) {
        if self.records.len() < capacity {
            self.records.push(record);
        }
        else {
            self.records[self.next] = record;
        }
        self.next = (self.next + 1) % capacity;
    }

    /// oldest first
    fn ordered(&self) -> impl Iterator<Item = &TraceRecord> {
        let (newer, older) = self.records.split_at(self.next.min(self.records.len()));
        older.iter().chain(newer.iter())
    }
}

#[derive(Debug)]
pub struct TimeTrace {
    id: u64,
    start: Instant,
    capacity: usize,
    buffers: Mutex<Vec<Arc<Mutex<TraceBuffer>>>>,
}

impl TimeTrace {
    pub const DEFAULT_CAPACITY: usize = 8192;

    pub fn new(capacity: usize) -> TimeTrace {
        TimeTrace {
            id: NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed),
            start: Instant::now(),
            capacity: capacity.max(1),
            buffers: Default::default(),
        }
    }

    pub fn record(&self, format: &'static str, args: [u32; 4]) {
        let timestamp = self.start.elapsed();
        let buffer = self.thread_buffer();
        buffer.lock().unwrap()
            .push(TraceRecord { timestamp, format, args }, self.capacity);
    }

    fn thread_buffer(&self) -> Arc<Mutex<TraceBuffer>> {
        THREAD_BUFFERS.with(|cell| {
            let mut local = cell.borrow_mut();
            if let Some(buffer) = local.get(&self.id) {
                return buffer.clone();
            }

            // buffers of traces that were dropped in the meantime
            local.retain(|_, b| Arc::strong_count(b) > 1);

            let buffer = Arc::new(Mutex::new(TraceBuffer {
                records: Vec::new(),
                next: 0,
            }));
            self.buffers.lock().unwrap().push(buffer.clone());
            local.insert(self.id, buffer.clone());
            buffer
        })
    }

    /// All records of all threads, ordered by timestamp
    pub fn report(&self) -> Vec<TraceRecord> {
        let buffers: Vec<Arc<Mutex<TraceBuffer>>> = self.buffers.lock().unwrap().clone();

        let mut result = Vec::new();
        for buffer in buffers {
            let buffer = buffer.lock().unwrap();
            result.extend(buffer.ordered().copied());
        }
        result.sort_by_key(|r| r.timestamp);
        result
    }

    /// The report in text form, one record per line with the timestamp in microseconds
    pub fn format_report(&self) -> String {
        self.report().iter()
            .map(|r| format!("{:>12.3} {}\n", r.timestamp.as_secs_f64() * 1e6, r.message()))
            .collect()
    }
}

impl Default for TimeTrace {
    fn default() -> Self {
        TimeTrace::new(Self::DEFAULT_CAPACITY)
    }
}

/// The records with timestamps between `start` and `end` (both inclusive). `records` must be
///  ordered by timestamp, as [TimeTrace::report] returns them.
pub fn time_range(records: &[TraceRecord], start: Duration, end: Duration) -> &[TraceRecord] {
    let from = records.partition_point(|r| r.timestamp < start);
    let to = records.partition_point(|r| r.timestamp <= end).max(from);
    &records[from..to]
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_message() {
        let record = TraceRecord { timestamp: Duration::ZERO, format: "data for id {}, offset {}", args: [7, 1400, 0, 0] };
        assert_eq!(record.message(), "data for id 7, offset 1400");
    }

    #[test]
    fn test_wraparound_keeps_newest() {
        let trace = TimeTrace::new(3);
        for i in 0..5 {
            trace.record("event {}", [i, 0, 0, 0]);
        }
        let args: Vec<u32> = trace.report().iter().map(|r| r.args[0]).collect();
        assert_eq!(args, vec![2, 3, 4]);
    }

    #[test]
    fn test_threads_have_separate_buffers() {
        let trace = Arc::new(TimeTrace::new(2));
        trace.record("main {}", [1, 0, 0, 0]);
        let t = trace.clone();
        std::thread::spawn(move || {
            t.record("other {}", [1, 0, 0, 0]);
            t.record("other {}", [2, 0, 0, 0]);
            t.record("other {}", [3, 0, 0, 0]);
        }).join().unwrap();

        let report = trace.report();
        assert_eq!(report.len(), 3);
        assert_eq!(report.iter().filter(|r| r.format.starts_with("main")).count(), 1);
        assert!(report.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_concurrent_threads_lose_nothing() {
        let trace = Arc::new(TimeTrace::new(1_000_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let trace = trace.clone();
                std::thread::spawn(move || {
                    for i in 0..20_000 {
                        trace.record("thread {} event {}", [t, i, 0, 0]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = trace.report();
        assert_eq!(report.len(), 8 * 20_000);
        for t in 0..8 {
            assert_eq!(report.iter().filter(|r| r.args[0] == t).count(), 20_000);
        }
    }

    #[test]
    fn test_traces_are_independent() {
        let first = TimeTrace::new(10);
        let second = TimeTrace::new(10);
        first.record("first", [0; 4]);
        second.record("second", [0; 4]);
        second.record("second", [0; 4]);

        assert_eq!(first.report().len(), 1);
        assert_eq!(second.report().len(), 2);
    }

    #[rstest]
    #[case::inner(20, 50, vec![20, 35, 50])]
    #[case::everything(0, 100, vec![10, 20, 35, 50, 70])]
    #[case::between_records(21, 34, vec![])]
    #[case::single(70, 70, vec![70])]
    #[case::before_all(0, 5, vec![])]
    #[case::reversed(50, 20, vec![])]
    fn test_time_range(#[case] start: u64, #[case] end: u64, #[case] expected: Vec<u64>) {
        let records: Vec<TraceRecord> = [10, 20, 35, 50, 70].iter()
            .map(|&micros| TraceRecord {
                timestamp: Duration::from_micros(micros),
                format: "event",
                args: [0; 4],
            })
            .collect();

        let selected: Vec<u64> = time_range(&records, Duration::from_micros(start), Duration::from_micros(end)).iter()
            .map(|r| r.timestamp.as_micros() as u64)
            .collect();
        assert_eq!(selected, expected);
    }
}
