//! End-to-end RPC tests over the UDP transport.
//!
//! Run with:
//! ```bash
//! cargo test --test rpc_tests
//! ```

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{connect, new_broker, new_rpc, pattern, run_until};
use udrpc::{
    Error, HandlerKind, SmErrType, SmEventType, SESSION_CREDITS, SESSION_REQ_WINDOW,
};

// =============================================================================
// Scenario 1: single-packet echo
// =============================================================================

#[test]
fn test_single_packet_echo() {
    let broker = new_broker(0);
    broker.register_req_handler(7, HandlerKind::Foreground, |req| {
        let mut data = req.req().to_vec();
        data.reverse();
        let resp = req.alloc_response(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    });

    let (server, _) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    let mut req = client.alloc_msg_buffer(5).unwrap();
    req.data_mut().copy_from_slice(b"hello");

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got_c = got.clone();
    client
        .enqueue_request(
            session,
            7,
            req,
            move |resp| {
                *got_c.lock().unwrap() = Some(resp.resp().to_vec());
            },
            0,
        )
        .unwrap();

    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        got.lock().unwrap().is_some()
    });
    assert!(ok, "no response");
    assert_eq!(got.lock().unwrap().as_deref(), Some(&b"olleh"[..]));

    assert_eq!(client.num_active_sessions(), 1);
    assert_eq!(server.num_active_sessions(), 1);

    // Credit conservation at quiescence, and every client-side buffer is
    // back with its owner.
    assert_eq!(client.session_credits(session).unwrap(), SESSION_CREDITS);
    assert_eq!(client.allocator().live_bufs(), 0);
}

// =============================================================================
// Scenario 2: multi-packet request and response
// =============================================================================

#[test]
fn test_multi_packet_round_trip() {
    const REQ_LEN: usize = 3200; // 4 packets at 1024 B/packet
    const RESP_LEN: usize = 5000; // 5 packets

    let broker = new_broker(0);
    broker.register_req_handler(9, HandlerKind::Foreground, move |req| {
        assert_eq!(req.req(), &pattern(REQ_LEN, 3)[..]);
        let resp = req.alloc_response(RESP_LEN).unwrap();
        resp.data_mut().copy_from_slice(&pattern(RESP_LEN, 9));
    });

    let (server, _) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    let mut req = client.alloc_msg_buffer(REQ_LEN).unwrap();
    req.data_mut().copy_from_slice(&pattern(REQ_LEN, 3));

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got_c = got.clone();
    client
        .enqueue_request(
            session,
            9,
            req,
            move |resp| {
                *got_c.lock().unwrap() = Some(resp.resp().to_vec());
            },
            0,
        )
        .unwrap();

    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        got.lock().unwrap().is_some()
    });
    assert!(ok, "no response");
    assert_eq!(got.lock().unwrap().as_deref(), Some(&pattern(RESP_LEN, 9)[..]));

    // 4 REQ packets and 4 RFRs from the client; 3 CRs (every request packet
    // but the last) and 5 RESP packets from the server.
    let cs = client.dpath_stats();
    let ss = server.dpath_stats();
    assert_eq!(cs.tx_req_pkts, 4);
    assert_eq!(cs.tx_rfr_pkts, 4);
    assert_eq!(ss.tx_cr_pkts, 3);
    assert_eq!(ss.tx_resp_pkts, 5);
    assert_eq!(cs.retransmits, 0);
    assert_eq!(ss.retransmits, 0);

    assert_eq!(client.session_credits(session).unwrap(), SESSION_CREDITS);
}

// =============================================================================
// Scenario 3: window exhaustion
// =============================================================================

#[test]
fn test_window_exhaustion() {
    let broker = new_broker(0);
    broker.register_req_handler(1, HandlerKind::Foreground, |req| {
        let data = req.req().to_vec();
        let resp = req.alloc_response(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    });

    let (server, _) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    let completed = Arc::new(AtomicUsize::new(0));

    // Fill the whole window before running the event loop.
    for i in 0..SESSION_REQ_WINDOW {
        let mut req = client.alloc_msg_buffer(8).unwrap();
        req.data_mut().copy_from_slice(&(i as u64).to_le_bytes());
        let completed = completed.clone();
        client
            .enqueue_request(
                session,
                1,
                req,
                move |resp| {
                    assert_eq!(resp.resp().len(), 8);
                    completed.fetch_add(1, Ordering::SeqCst);
                },
                i as u64,
            )
            .unwrap();
    }

    // The ninth request must fail with no slot available, returning the
    // buffer.
    let mut req = client.alloc_msg_buffer(8).unwrap();
    req.data_mut().copy_from_slice(b"ninth!!!");
    let err = client
        .enqueue_request(session, 1, req, |_resp| {}, 99)
        .unwrap_err();
    let (error, req) = err.into_parts();
    assert!(matches!(error, Error::NoSlotAvailable));

    // Drain the window, then the same call succeeds.
    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        completed.load(Ordering::SeqCst) == SESSION_REQ_WINDOW
    });
    assert!(ok, "window did not drain");

    let completed_c = completed.clone();
    client
        .enqueue_request(
            session,
            1,
            req,
            move |_resp| {
                completed_c.fetch_add(1, Ordering::SeqCst);
            },
            99,
        )
        .unwrap();
    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        completed.load(Ordering::SeqCst) == SESSION_REQ_WINDOW + 1
    });
    assert!(ok, "ninth request did not complete");
}

// =============================================================================
// Scenario 4: injected local drop and retransmission
// =============================================================================

#[test]
fn test_injected_drop_retransmit() {
    let broker = new_broker(0);
    broker.register_req_handler(2, HandlerKind::Foreground, |req| {
        let data = req.req().to_vec();
        let resp = req.alloc_response(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    });

    let (server, _) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    // Drop the very next datapath packet: the request.
    client.fault_inject_drop_tx_local(0);

    let mut req = client.alloc_msg_buffer(4).unwrap();
    req.data_mut().copy_from_slice(b"lost");

    let done = Arc::new(AtomicUsize::new(0));
    let done_c = done.clone();
    let start = Instant::now();
    client
        .enqueue_request(
            session,
            2,
            req,
            move |resp| {
                assert_eq!(resp.resp(), b"lost");
                done_c.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();

    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 1
    });
    assert!(ok, "retransmit never completed the request");

    // Completion required the loss timeout to fire.
    assert!(start.elapsed() >= Duration::from_millis(400));
    let cs = client.dpath_stats();
    assert_eq!(cs.tx_faults_dropped, 1);
    assert!(cs.retransmits >= 1);

    // Exactly one continuation despite the retransmit.
    client.run_event_loop_timeout(100);
    server.run_event_loop_timeout(100);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Scenario 4b: injected remote drop (response lost)
// =============================================================================

#[test]
fn test_injected_remote_drop() {
    let broker = new_broker(0);
    broker.register_req_handler(2, HandlerKind::Foreground, |req| {
        let data = req.req().to_vec();
        let resp = req.alloc_response(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    });

    let (server, _) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    client.fault_inject_drop_tx_remote(session, 0).unwrap();
    // Give the side-channel packet time to arrive.
    run_until(&[&client, &server], Duration::from_millis(100), || false);

    let done = Arc::new(AtomicUsize::new(0));
    let done_c = done.clone();
    let mut req = client.alloc_msg_buffer(4).unwrap();
    req.data_mut().copy_from_slice(b"drop");
    client
        .enqueue_request(
            session,
            2,
            req,
            move |_resp| {
                done_c.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();

    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 1
    });
    assert!(ok, "request never recovered from response loss");
    assert_eq!(server.dpath_stats().tx_faults_dropped, 1);
}

// =============================================================================
// Scenario 5: disconnect with a request in flight
// =============================================================================

#[test]
fn test_disconnect_with_inflight_request() {
    let broker = new_broker(0);
    broker.register_req_handler(3, HandlerKind::Foreground, |req| {
        let data = req.req().to_vec();
        let resp = req.alloc_response(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    });

    let (server, _server_log) = new_rpc(&broker, 0);
    let (client, client_log) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    let done = Arc::new(AtomicUsize::new(0));
    let done_c = done.clone();
    let mut req = client.alloc_msg_buffer(6).unwrap();
    req.data_mut().copy_from_slice(b"linger");
    client
        .enqueue_request(
            session,
            3,
            req,
            move |resp| {
                assert_eq!(resp.resp(), b"linger");
                done_c.fetch_add(1, Ordering::SeqCst);
            },
            0,
        )
        .unwrap();

    // Destroy before the response has arrived; the session drains first.
    client.destroy_session(session).unwrap();

    let disconnected = || {
        client_log
            .lock()
            .unwrap()
            .iter()
            .any(|ev| ev.event == SmEventType::Disconnected && ev.session_num == session)
    };
    let ok = run_until(&[&client, &server], Duration::from_secs(5), disconnected);
    assert!(ok, "disconnect did not complete");

    // The continuation fired before the session was reaped.
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(client.num_active_sessions(), 0);
    assert_eq!(server.num_active_sessions(), 0);

    // The session number is dead now.
    let mut req = client.alloc_msg_buffer(1).unwrap();
    req.data_mut().copy_from_slice(b"x");
    let err = client
        .enqueue_request(session, 3, req, |_resp| {}, 0)
        .unwrap_err();
    let (error, req) = err.into_parts();
    assert!(matches!(error, Error::NoSuchSession(n) if n == session));
    client.free_msg_buffer(req);
}

// =============================================================================
// Scenario 6: background handler keeps the endpoint responsive
// =============================================================================

#[test]
fn test_background_handler() {
    let broker = new_broker(2);
    broker.register_req_handler(5, HandlerKind::Background, |req| {
        std::thread::sleep(Duration::from_millis(10));
        let data = req.req().to_vec();
        let resp = req.alloc_response(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    });
    broker.register_req_handler(6, HandlerKind::Foreground, |req| {
        let data = req.req().to_vec();
        let resp = req.alloc_response(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    });

    let (server, _) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    let bg_done: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let fg_done: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

    // The continuation for the slow request also runs on a worker thread.
    let bg_done_c = bg_done.clone();
    let mut req = client.alloc_msg_buffer(4).unwrap();
    req.data_mut().copy_from_slice(b"slow");
    client
        .enqueue_request_bg_cont(
            session,
            5,
            req,
            move |resp| {
                assert_eq!(resp.resp(), b"slow");
                *bg_done_c.lock().unwrap() = Some(Instant::now());
            },
            0,
        )
        .unwrap();

    let fg_done_c = fg_done.clone();
    let mut req = client.alloc_msg_buffer(4).unwrap();
    req.data_mut().copy_from_slice(b"fast");
    client
        .enqueue_request(
            session,
            6,
            req,
            move |resp| {
                assert_eq!(resp.resp(), b"fast");
                *fg_done_c.lock().unwrap() = Some(Instant::now());
            },
            0,
        )
        .unwrap();

    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        bg_done.lock().unwrap().is_some() && fg_done.lock().unwrap().is_some()
    });
    assert!(ok, "requests did not complete");

    // The endpoint made progress while the background handler slept.
    let bg_at = bg_done.lock().unwrap().unwrap();
    let fg_at = fg_done.lock().unwrap().unwrap();
    assert!(fg_at < bg_at, "foreground request was blocked behind the sleeping handler");
}

// =============================================================================
// Session-management failure paths
// =============================================================================

#[test]
fn test_connect_to_unknown_endpoint_fails() {
    let broker = new_broker(0);
    let (client, log) = new_rpc(&broker, 1);

    let session = client.create_session(broker.uri(), 99, 0).unwrap();
    let ok = run_until(&[&client], Duration::from_secs(5), || {
        log.lock().unwrap().iter().any(|ev| {
            ev.session_num == session
                && ev.event == SmEventType::ConnectFailed
                && ev.err == SmErrType::InvalidRemoteEndpoint
        })
    });
    assert!(ok, "no ConnectFailed event");
    assert_eq!(client.num_active_sessions(), 0);
}

#[test]
fn test_injected_routing_resolution_failure() {
    let broker = new_broker(0);
    let (server, _) = new_rpc(&broker, 0);
    let (client, log) = new_rpc(&broker, 1);

    client.fault_inject_resolve_rinfo();
    let session = client.create_session(broker.uri(), 0, 0).unwrap();
    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        log.lock().unwrap().iter().any(|ev| {
            ev.session_num == session
                && ev.event == SmEventType::ConnectFailed
                && ev.err == SmErrType::RoutingResolutionFailed
        })
    });
    assert!(ok, "no ConnectFailed event");
    assert_eq!(client.num_active_sessions(), 0);
}

#[test]
fn test_reset_remote_peer_fault() {
    let broker = new_broker(0);
    let (server, server_log) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);
    assert_eq!(server.num_active_sessions(), 1);

    client.fault_inject_reset_remote_peer(session).unwrap();
    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        server_log
            .lock()
            .unwrap()
            .iter()
            .any(|ev| ev.event == SmEventType::Disconnected)
    });
    assert!(ok, "server never observed the peer reset");
    assert_eq!(server.num_active_sessions(), 0);
}

// =============================================================================
// Unknown request types
// =============================================================================

#[test]
fn test_unknown_req_type_gets_empty_response() {
    let broker = new_broker(0);
    let (server, _) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let got_c = got.clone();
    let mut req = client.alloc_msg_buffer(3).unwrap();
    req.data_mut().copy_from_slice(b"???");
    client
        .enqueue_request(
            session,
            200,
            req,
            move |resp| {
                *got_c.lock().unwrap() = Some(resp.resp().to_vec());
            },
            0,
        )
        .unwrap();

    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        got.lock().unwrap().is_some()
    });
    assert!(ok, "no error response");
    assert_eq!(got.lock().unwrap().as_deref(), Some(&[][..]));
}

// =============================================================================
// Request buffer round trip
// =============================================================================

#[test]
fn test_request_buffer_returned_to_user() {
    let broker = new_broker(0);
    broker.register_req_handler(4, HandlerKind::Foreground, |req| {
        let data = req.req().to_vec();
        let resp = req.alloc_response(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    });

    let (server, _) = new_rpc(&broker, 0);
    let (client, _) = new_rpc(&broker, 1);
    let session = connect(&client, &server, &broker, 0);

    let reclaimed: Arc<Mutex<Option<udrpc::MsgBuffer>>> = Arc::new(Mutex::new(None));
    let reclaimed_c = reclaimed.clone();
    let mut req = client.alloc_msg_buffer(64).unwrap();
    req.data_mut()[..5].copy_from_slice(b"again");
    client.resize_msg_buffer(&mut req, 5).unwrap();
    client
        .enqueue_request(
            session,
            4,
            req,
            move |mut resp| {
                *reclaimed_c.lock().unwrap() = resp.take_req_msg_buffer();
            },
            0,
        )
        .unwrap();

    let ok = run_until(&[&client, &server], Duration::from_secs(5), || {
        reclaimed.lock().unwrap().is_some()
    });
    assert!(ok, "no response");

    // The same buffer is usable for another request.
    let req = reclaimed.lock().unwrap().take().unwrap();
    assert_eq!(req.data(), b"again");
    assert_eq!(client.allocator().live_bufs(), 1);
    client.free_msg_buffer(req);
    assert_eq!(client.allocator().live_bufs(), 0);
}
