//! Shared fixtures for integration tests.
//!
//! Endpoints in these tests live in one process and share a single broker,
//! with datapath traffic over localhost UDP and session management over the
//! broker's loopback path.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use udrpc::{Broker, Rpc, SessionState, SmEvent, UdpTransport};

pub type TestRpc = Rpc<UdpTransport>;

/// SM events recorded by an endpoint's callback.
pub type EventLog = Arc<Mutex<Vec<SmEvent>>>;

pub fn new_broker(num_bg_threads: usize) -> Arc<Broker> {
    Arc::new(Broker::new("127.0.0.1:0", num_bg_threads).expect("broker"))
}

/// Create an endpoint whose SM callback appends into the returned log.
pub fn new_rpc(broker: &Arc<Broker>, endpoint_id: u8) -> (TestRpc, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let rpc = Rpc::new(
        broker,
        endpoint_id,
        move |ev| sink.lock().unwrap().push(ev),
        0,
        0,
    )
    .expect("endpoint");
    (rpc, log)
}

/// Poll the given event loops until `pred` holds. Returns false on timeout.
pub fn run_until(rpcs: &[&TestRpc], timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        for rpc in rpcs {
            rpc.run_event_loop_once();
        }
        if pred() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

/// Connect `client` to `server` (sharing `broker`) and return the client's
/// session number.
pub fn connect(
    client: &TestRpc,
    server: &TestRpc,
    broker: &Arc<Broker>,
    server_endpoint_id: u8,
) -> u16 {
    let session_num = client
        .create_session(broker.uri(), server_endpoint_id, 0)
        .expect("create_session");
    let ok = run_until(&[client, server], Duration::from_secs(5), || {
        matches!(
            client.session_state(session_num),
            Ok(SessionState::Connected)
        )
    });
    assert!(ok, "session did not connect");
    session_num
}

/// Build a deterministic payload of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
