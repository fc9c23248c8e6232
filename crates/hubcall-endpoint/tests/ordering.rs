//! Ordering guarantees of single-threaded endpoints under real threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hubcall_endpoint::{Endpoint, Implementor, InvocationContext};
use hubcall_protocol::{Capability, RemoteError, RemoteMethodCall};
use hubcall_transport::Node;
use serde_json::{Value, json};

// =========================================================================
// Recording implementor: logs the sequence number of every body it runs
// against a counter shared by all implementors.
// =========================================================================

struct Recorder {
    clock: Arc<AtomicU64>,
    log: Arc<Mutex<Vec<(u64, u64)>>>,
}

fn capability() -> Capability {
    Capability::new("Turn").method("play", ["u64"])
}

impl Implementor for Recorder {
    fn capabilities(&self) -> Vec<Capability> {
        vec![capability()]
    }

    fn invoke(&self, ctx: &InvocationContext, _: &RemoteMethodCall) -> Result<Value, RemoteError> {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst);
        // Give later callers a chance to overtake if the gate were broken.
        thread::sleep(Duration::from_millis(1));
        self.log.lock().unwrap().push((tick, ctx.sequence));
        Ok(json!(ctx.sequence))
    }
}

fn call(n: u64) -> RemoteMethodCall {
    RemoteMethodCall::new("turn", "play").arg("u64", n)
}

fn recording_endpoint(single_threaded: bool) -> (Arc<Endpoint>, Arc<Mutex<Vec<(u64, u64)>>>) {
    let endpoint = Arc::new(Endpoint::new("turn", capability(), single_threaded));
    let clock = Arc::new(AtomicU64::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        endpoint
            .add_implementor(Arc::new(Recorder {
                clock: Arc::clone(&clock),
                log: Arc::clone(&log),
            }))
            .unwrap();
    }
    (endpoint, log)
}

#[test]
fn test_single_threaded_bodies_run_in_sequence_order() {
    let (endpoint, log) = recording_endpoint(true);

    // Take all numbers up front, then start the threads in reverse so the
    // highest number is the first to reach the gate.
    let numbers: Vec<u64> = (0..16).map(|_| endpoint.take_a_number()).collect();
    let handles: Vec<_> = numbers
        .iter()
        .rev()
        .map(|&number| {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || endpoint.invoke_local(&call(number), number, &Node::new("host")))
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().len(), 2);
    }

    let mut log = log.lock().unwrap().clone();
    log.sort_by_key(|(tick, _)| *tick);
    let sequences: Vec<u64> = log.iter().map(|(_, sequence)| *sequence).collect();
    assert_eq!(sequences.len(), 32);
    assert!(
        sequences.windows(2).all(|w| w[0] <= w[1]),
        "bodies ran out of order: {sequences:?}"
    );
}

#[test]
fn test_concurrent_numbers_are_unique() {
    let (endpoint, _) = recording_endpoint(false);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || (0..250).map(|_| endpoint.take_a_number()).collect::<Vec<_>>())
        })
        .collect();

    let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 1_000);
}

#[test]
fn test_multi_threaded_endpoint_does_not_wait_for_lower_numbers() {
    let (endpoint, _) = recording_endpoint(false);
    let _skipped = endpoint.take_a_number();
    let number = endpoint.take_a_number();

    // Number 0 is never run; a multi-threaded endpoint must not care.
    let results = endpoint.invoke_local(&call(number), number, &Node::new("host"));
    assert_eq!(results.len(), 2);
}
