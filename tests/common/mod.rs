//! Helpers shared by the transport integration tests

#![allow(dead_code)]

use std::time::{Duration, Instant};

use peerlink::event::{Event, EventKind, EventReceiver};

/// How long a test waits for something that should happen promptly
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds, panicking with `what` after [`PATIENCE`]
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Next queued event matching `accept`, skipping others
pub fn next_matching(events: &mut EventReceiver, what: &str, accept: impl Fn(&Event) -> bool) -> Event {
    let deadline = Instant::now() + PATIENCE;
    loop {
        match events.try_recv() {
            Some(event) if accept(&event) => return event,
            Some(_) => continue,
            None => {
                assert!(Instant::now() < deadline, "timed out waiting for {}", what);
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

/// Next data event, skipping timeouts
pub fn next_data(events: &mut EventReceiver) -> Event {
    next_matching(events, "data event", |e| matches!(e.kind(), EventKind::Data(_)))
}

/// Next exception event
pub fn next_exception(events: &mut EventReceiver) -> Event {
    next_matching(events, "exception event", |e| matches!(e.kind(), EventKind::Exception(_)))
}

/// Collect `count` data payloads in arrival order
pub fn collect_payloads(events: &mut EventReceiver, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|_| {
            let event = next_data(events);
            event.payload().map(|b| b.to_vec()).unwrap_or_default()
        })
        .collect()
}

/// Install a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
