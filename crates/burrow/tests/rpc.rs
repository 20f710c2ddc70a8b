//! End-to-end client/service scenarios over a real shared region.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use burrow::{Client, ClientConfig, ConnectError, Service, Status, PROTOCOL_VERSION};

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn u32_of(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes.try_into().expect("4-byte payload"))
}

#[test]
fn echo_plus_one() {
    init_tracing();

    let service = Service::new("it-echo");
    service.set_request_handler(|method_id, request| {
        if method_id != 7 {
            return (Status::INVALID_METHOD, Vec::new());
        }
        let x = u32_of(request);
        (Status::OK, (x + 1).to_le_bytes().to_vec())
    });
    service.start().unwrap();

    let client = Client::new("it-echo");
    client.connect().unwrap();

    let reply = client
        .call(1, 7, &41u32.to_le_bytes(), Duration::from_secs(2))
        .expect("call should succeed");
    assert_eq!(u32_of(&reply), 42);

    // A method the handler refuses surfaces its status to the caller.
    let err = client.call(1, 8, &[], Duration::from_secs(2)).unwrap_err();
    assert_eq!(err, Status::INVALID_METHOD);

    client.disconnect();
    service.stop();
}

#[test]
fn version_mismatch_is_rejected() {
    init_tracing();

    let service = Service::new("it-version");
    service.start().unwrap();

    let client = Client::new("it-version");
    let err = client
        .connect_with(PROTOCOL_VERSION + 1, Duration::from_millis(10), 10)
        .unwrap_err();
    assert!(matches!(err, ConnectError::Rejected { offered } if offered == PROTOCOL_VERSION + 1));
    assert!(!client.is_connected());

    // The rejected attempt left no connection behind, and the service still
    // accepts well-versioned clients.
    assert_eq!(service.connection_count(), 0);
    let ok_client = Client::new("it-version");
    ok_client.connect().unwrap();

    ok_client.disconnect();
    service.stop();
}

#[test]
fn duplicate_service_name_fails_at_second_start() {
    init_tracing();

    let first = Service::new("it-dup");
    first.start().unwrap();

    let second = Service::new("it-dup");
    assert!(second.start().is_err());

    first.stop();
    // The name is free again once the first service is gone.
    assert!(second.start().is_ok());
    second.stop();
}

#[test]
fn broadcast_reaches_every_client_once() {
    init_tracing();

    let service = Service::new("it-notify");
    service.start().unwrap();

    let client_a = Client::new("it-notify");
    let client_b = Client::new("it-notify");

    let seen_a = Arc::new(AtomicUsize::new(0));
    let seen_b = Arc::new(AtomicUsize::new(0));
    for (client, seen) in [(&client_a, &seen_a), (&client_b, &seen_b)] {
        let seen = seen.clone();
        client.set_notify_handler(move |notify_id, payload| {
            assert_eq!(notify_id, 99);
            assert_eq!(u32_of(payload), 123);
            seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    client_a.connect().unwrap();
    client_b.connect().unwrap();
    assert!(wait_until(Duration::from_secs(2), || service.connection_count() == 2));

    service.notify(1, 99, &123u32.to_le_bytes()).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        seen_a.load(Ordering::SeqCst) == 1 && seen_b.load(Ordering::SeqCst) == 1
    }));

    // Exactly one invocation each.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(seen_a.load(Ordering::SeqCst), 1);
    assert_eq!(seen_b.load(Ordering::SeqCst), 1);

    client_a.disconnect();
    client_b.disconnect();
    service.stop();
}

#[test]
fn timeout_then_late_response_is_discarded() {
    init_tracing();

    // Method 1 answers far too late; method 2 answers immediately. The
    // first call must time out, and its eventual response must be silently
    // dropped rather than corrupt the second call.
    let service = Service::new("it-timeout");
    service.set_request_handler(|method_id, _request| {
        if method_id == 1 {
            thread::sleep(Duration::from_millis(300));
        }
        (Status::OK, method_id.to_le_bytes().to_vec())
    });
    service.start().unwrap();

    let client = Client::new("it-timeout");
    client.connect().unwrap();

    let started = Instant::now();
    let err = client.call(1, 1, &[], Duration::from_millis(100)).unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err, Status::TIMEOUT);
    assert!(elapsed >= Duration::from_millis(100), "returned before the deadline");
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?} to time out");

    // The reader is still busy with the slow request (handlers run
    // serially), so this response arrives after the orphan was discarded.
    let reply = client.call(1, 2, &[], Duration::from_secs(2)).expect("second call");
    assert_eq!(u32_of(&reply), 2);

    client.disconnect();
    service.stop();
}

#[test]
fn notify_backpressure_is_ring_full_then_recovers() {
    init_tracing();

    let service = Service::new("it-ringfull");
    service.start().unwrap();

    // Small rings, and a receiver that is deliberately slow to drain them.
    let client = Client::with_config("it-ringfull", ClientConfig { ring_capacity: 4096 });
    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        client.set_notify_handler(move |_notify_id, _payload| {
            thread::sleep(Duration::from_millis(20));
            received.fetch_add(1, Ordering::SeqCst);
        });
    }
    client.connect().unwrap();
    assert!(wait_until(Duration::from_secs(2), || service.connection_count() == 1));

    // Flood until the server→client ring refuses a frame.
    let payload = [0u8; 1024];
    let mut sent = 0usize;
    let mut saw_ring_full = false;
    for _ in 0..64 {
        match service.notify(1, 5, &payload) {
            Ok(()) => sent += 1,
            Err(status) => {
                assert_eq!(status, Status::RING_FULL);
                saw_ring_full = true;
                break;
            }
        }
    }
    assert!(saw_ring_full, "ring never filled after {sent} notifications");

    // Once the receiver has drained, the next notification goes through.
    assert!(wait_until(Duration::from_secs(10), || {
        service.notify(1, 5, &payload).is_ok()
    }));

    client.disconnect();
    service.stop();
}

#[test]
fn disconnect_wakes_a_blocked_caller() {
    init_tracing();

    let service = Service::new("it-disconnect");
    service.set_request_handler(|_method_id, _request| {
        thread::sleep(Duration::from_secs(2));
        (Status::OK, Vec::new())
    });
    service.start().unwrap();

    let client = Arc::new(Client::new("it-disconnect"));
    client.connect().unwrap();

    let caller = {
        let client = client.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = client.call(1, 1, &[], Duration::from_secs(5));
            (result, started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(100));
    let disconnected_at = Instant::now();
    client.disconnect();

    let (result, _elapsed) = caller.join().unwrap();
    let wake_latency = disconnected_at.elapsed();

    let status = result.unwrap_err();
    assert!(
        status == Status::STOPPED || status == Status::DISCONNECTED,
        "unexpected status {status}"
    );
    assert!(wake_latency < Duration::from_millis(1500), "caller woke after {wake_latency:?}");

    service.stop();
}

#[test]
fn peer_shutdown_fails_pending_calls() {
    init_tracing();

    let service = Service::new("it-peerdeath");
    service.set_request_handler(|_method_id, _request| {
        thread::sleep(Duration::from_secs(2));
        (Status::OK, Vec::new())
    });
    service.start().unwrap();

    let client = Arc::new(Client::new("it-peerdeath"));
    client.connect().unwrap();

    let caller = {
        let client = client.clone();
        thread::spawn(move || client.call(1, 1, &[], Duration::from_secs(5)))
    };

    thread::sleep(Duration::from_millis(100));
    service.stop();

    let status = caller.join().unwrap().unwrap_err();
    assert_eq!(status, Status::DISCONNECTED);
    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()));
}

#[test]
fn concurrent_callers_multiplex_one_connection() {
    init_tracing();

    let service = Service::new("it-concurrent");
    service.set_request_handler(|_method_id, request| (Status::OK, request.to_vec()));
    service.start().unwrap();

    let client = Arc::new(Client::new("it-concurrent"));
    client.connect().unwrap();

    const THREADS: u32 = 4;
    const CALLS: u32 = 25;
    let mut callers = Vec::new();
    for thread_index in 0..THREADS {
        let client = client.clone();
        callers.push(thread::spawn(move || {
            for call_index in 0..CALLS {
                let token = thread_index * 1000 + call_index;
                let reply = client
                    .call(1, 1, &token.to_le_bytes(), Duration::from_secs(5))
                    .expect("echo call");
                assert_eq!(u32_of(&reply), token, "response routed to the wrong caller");
            }
        }));
    }
    for caller in callers {
        caller.join().unwrap();
    }

    client.disconnect();
    service.stop();
}

#[test]
fn client_notifications_do_not_disturb_calls() {
    init_tracing();

    let service = Service::new("it-client-notify");
    service.set_request_handler(|_method_id, request| (Status::OK, request.to_vec()));
    service.start().unwrap();

    let client = Client::new("it-client-notify");
    client.connect().unwrap();

    // Fire-and-forget notifications towards the service interleaved with
    // calls; the service consumes them and keeps answering.
    for i in 0..20u32 {
        client.notify(1, 42, &i.to_le_bytes()).unwrap();
        let reply = client.call(1, 1, &i.to_le_bytes(), Duration::from_secs(2)).unwrap();
        assert_eq!(u32_of(&reply), i);
    }

    client.disconnect();
    service.stop();
}

#[test]
fn call_without_connect_is_disconnected() {
    init_tracing();

    let client = Client::new("it-unconnected");
    let err = client.call(1, 1, &[], Duration::from_millis(100)).unwrap_err();
    assert_eq!(err, Status::DISCONNECTED);
    assert_eq!(client.notify(1, 1, &[]).unwrap_err(), Status::DISCONNECTED);

    // Disconnect on a never-connected client is a no-op.
    client.disconnect();
    client.disconnect();
}

#[test]
fn connect_gives_up_when_no_service_listens() {
    init_tracing();

    let client = Client::new("it-nobody-home");
    let started = Instant::now();
    let err = client.connect_with(PROTOCOL_VERSION, Duration::from_millis(5), 10).unwrap_err();
    assert!(matches!(err, ConnectError::Unreachable { attempts: 10, .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn hung_up_client_is_dropped_from_the_connection_table() {
    init_tracing();

    let service = Service::new("it-hangup");
    service.start().unwrap();

    let client = Client::new("it-hangup");
    client.connect().unwrap();
    assert!(wait_until(Duration::from_secs(2), || service.connection_count() == 1));

    client.disconnect();
    assert!(wait_until(Duration::from_secs(2), || service.connection_count() == 0));

    // Broadcasting into an empty table is a successful no-op.
    service.notify(1, 9, &[]).unwrap();
    service.stop();
}
