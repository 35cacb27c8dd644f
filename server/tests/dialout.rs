//! End-to-end tests: a collector and a producer talking over loopback in
//! each supported security posture.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use dialout_client::DialoutClient;
use dialout_common::{
    Batch, ClientOptions, DialoutError, Notification, Path, PathElem, ServerOptions,
    TelemetryMessage, Update,
};
use dialout_server::{DialoutServer, SessionInfo};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn tls_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("testdata/tls")
        .join(name)
}

/// Bind a collector on an ephemeral port, run its accept loop on a
/// background thread, and capture every handled batch on a channel.
fn start_server(options: ServerOptions) -> (Arc<DialoutServer>, Receiver<Batch>, String) {
    let (tx, rx) = unbounded();
    let server = DialoutServer::new("127.0.0.1:0", options)
        .expect("server construction")
        .with_handler(move |_: &SessionInfo, batch: Batch| {
            let _ = tx.send(batch);
        });
    let server = Arc::new(server);
    let address = server.local_addr().to_string();

    let serving = Arc::clone(&server);
    thread::spawn(move || {
        let _ = serving.serve();
    });

    (server, rx, address)
}

fn sync_marker() -> TelemetryMessage {
    TelemetryMessage::SyncMarker
}

#[test]
fn canonical_security_modes_deliver_batches() {
    init_logging();

    struct Case {
        name: &'static str,
        server: ServerOptions,
        client: ClientOptions,
    }

    let cases = vec![
        Case {
            // Mutual TLS: CA-validated certificates on both sides plus a
            // verified server name.
            name: "mutual tls",
            server: ServerOptions::new()
                .with_ca_file(tls_path("ca.crt"))
                .with_cert_file(tls_path("server.crt"))
                .with_key_file(tls_path("server.key"))
                .with_credentials("myaccount", "mypassword"),
            client: ClientOptions::new()
                .with_server_name("collector.test")
                .with_ca_file(tls_path("ca.crt"))
                .with_cert_file(tls_path("client.crt"))
                .with_key_file(tls_path("client.key"))
                .with_credentials("myaccount", "mypassword"),
        },
        Case {
            // Skip-verify: only the server's own certificate and key are
            // required; the client checks nothing.
            name: "skip-verify",
            server: ServerOptions::new()
                .with_skip_verify(true)
                .with_cert_file(tls_path("server.crt"))
                .with_key_file(tls_path("server.key"))
                .with_credentials("myaccount", "mypassword"),
            client: ClientOptions::new()
                .with_skip_verify(true)
                .with_credentials("myaccount", "mypassword"),
        },
        Case {
            name: "insecure",
            server: ServerOptions::new()
                .with_insecure(true)
                .with_credentials("myaccount", "mypassword"),
            client: ClientOptions::new()
                .with_insecure(true)
                .with_credentials("myaccount", "mypassword"),
        },
    ];

    for case in cases {
        let (server, rx, address) = start_server(case.server);

        let mut client = DialoutClient::new(&address, case.client)
            .unwrap_or_else(|e| panic!("{}: connect failed: {e}", case.name));
        client
            .send(&[sync_marker()])
            .unwrap_or_else(|e| panic!("{}: send failed: {e}", case.name));

        let batch = rx
            .recv_timeout(RECV_TIMEOUT)
            .unwrap_or_else(|e| panic!("{}: no batch delivered: {e}", case.name));
        assert_eq!(batch, vec![sync_marker()], "{}", case.name);

        client.close().unwrap();
        server.close().unwrap();
    }
}

#[test]
fn rejected_credentials_leave_other_sessions_alone() {
    init_logging();
    let options = ServerOptions::new()
        .with_insecure(true)
        .with_credentials("myaccount", "mypassword");
    let (server, rx, address) = start_server(options);

    let good_options = ClientOptions::new()
        .with_insecure(true)
        .with_credentials("myaccount", "mypassword");
    let mut good = DialoutClient::new(&address, good_options).unwrap();
    good.send(&[sync_marker()]).unwrap();
    rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // Wrong password.
    let err = DialoutClient::new(
        &address,
        ClientOptions::new()
            .with_insecure(true)
            .with_credentials("myaccount", "wrong"),
    )
    .unwrap_err();
    assert!(matches!(err, DialoutError::Authentication(_)), "{err}");

    // No credentials at all.
    let err = DialoutClient::new(&address, ClientOptions::new().with_insecure(true)).unwrap_err();
    assert!(matches!(err, DialoutError::Authentication(_)), "{err}");

    // The established session keeps streaming.
    good.send(&[sync_marker()]).unwrap();
    let batch = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(batch, vec![sync_marker()]);

    good.close().unwrap();
    server.close().unwrap();
}

#[test]
fn close_with_active_sessions_is_bounded_and_idempotent() {
    init_logging();
    let options = ServerOptions::new()
        .with_insecure(true)
        .with_credentials("myaccount", "mypassword");
    let (server, _rx, address) = start_server(options);

    let client_options = ClientOptions::new()
        .with_insecure(true)
        .with_credentials("myaccount", "mypassword");
    let _one = DialoutClient::new(&address, client_options.clone()).unwrap();
    let _two = DialoutClient::new(&address, client_options).unwrap();
    assert_eq!(server.active_sessions(), 2);

    let started = Instant::now();
    server.close().unwrap();
    // Grace period is 3s; closing must not run far past it.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.active_sessions(), 0);

    // Second close is a no-op with the first recorded outcome.
    server.close().unwrap();
}

#[test]
fn second_concurrent_serve_is_rejected() {
    init_logging();
    let (server, _rx, _address) = start_server(ServerOptions::new().with_insecure(true));

    // start_server already runs the accept loop on a background thread.
    thread::sleep(Duration::from_millis(50));
    let err = server.serve().unwrap_err();
    assert!(matches!(err, DialoutError::InvalidState(_)), "{err}");

    server.close().unwrap();

    // After close the server reports the closed state instead.
    let err = server.serve().unwrap_err();
    assert!(matches!(err, DialoutError::Closed), "{err}");
}

#[test]
fn close_reports_sessions_that_outlive_the_forced_abort() {
    init_logging();
    let (started_tx, started_rx) = unbounded();
    let server = DialoutServer::new("127.0.0.1:0", ServerOptions::new().with_insecure(true))
        .expect("server construction")
        .with_handler(move |_: &SessionInfo, _batch: Batch| {
            let _ = started_tx.send(());
            // Outlives the grace period and the abort wait combined.
            thread::sleep(Duration::from_secs(8));
        });
    let server = Arc::new(server);
    let address = server.local_addr().to_string();
    let serving = Arc::clone(&server);
    thread::spawn(move || {
        let _ = serving.serve();
    });

    let mut client =
        DialoutClient::new(&address, ClientOptions::new().with_insecure(true)).unwrap();
    client.send(&[sync_marker()]).unwrap();
    started_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    let err = server.close().unwrap_err();
    assert!(matches!(err, DialoutError::Shutdown(_)), "{err}");

    // The recorded outcome sticks across repeated closes.
    let err = server.close().unwrap_err();
    assert!(matches!(err, DialoutError::Shutdown(_)), "{err}");

    let _ = client.close();
}

#[test]
fn empty_batch_is_a_silent_no_op() {
    init_logging();
    let (server, rx, address) = start_server(ServerOptions::new().with_insecure(true));

    let mut client =
        DialoutClient::new(&address, ClientOptions::new().with_insecure(true)).unwrap();
    client.send(&[]).unwrap();
    client.send(&[sync_marker()]).unwrap();

    // The first batch to reach the handler is the marker; the empty send
    // never produced an invocation.
    let batch = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(batch, vec![sync_marker()]);
    assert!(rx.try_recv().is_err());

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn message_order_is_preserved_within_and_across_sends() {
    init_logging();
    let (server, rx, address) = start_server(ServerOptions::new().with_insecure(true));

    let note = |ts: i64| {
        TelemetryMessage::Notification(Notification {
            timestamp: ts,
            prefix: Some(Path::from_names(["system"])),
            alias: None,
            updates: vec![Update::uint(Path::from_names(["uptime"]), ts as u64)],
        })
    };

    let mut client =
        DialoutClient::new(&address, ClientOptions::new().with_insecure(true)).unwrap();
    let first = vec![note(1), note(2), note(3)];
    let second = vec![note(4), note(5)];
    client.send(&first).unwrap();
    client.send(&second).unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), first);
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), second);

    client.close().unwrap();
    server.close().unwrap();
}

/// Scenario A: skip-verify on both sides, the client without a server
/// name, one synchronization marker end to end.
#[test]
fn skip_verify_roundtrip_delivers_exactly_the_marker() {
    init_logging();
    let options = ServerOptions::new()
        .with_skip_verify(true)
        .with_cert_file(tls_path("server.crt"))
        .with_key_file(tls_path("server.key"));
    let (server, rx, address) = start_server(options);

    let mut client =
        DialoutClient::new(&address, ClientOptions::new().with_skip_verify(true)).unwrap();
    client.send(&[sync_marker()]).unwrap();

    let batch = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0], sync_marker());

    client.close().unwrap();
    server.close().unwrap();
}

/// Scenario B: insecure on both sides, a three-message batch establishing
/// an alias and then publishing a counter under it.
#[test]
fn insecure_roundtrip_preserves_structured_content() {
    init_logging();
    let (server, rx, address) = start_server(ServerOptions::new().with_insecure(true));

    let alias_note = TelemetryMessage::Notification(Notification {
        timestamp: 0,
        prefix: Some(Path {
            elems: vec![
                PathElem::new("interfaces"),
                PathElem::new("interface").with_key("name", "1/1"),
            ],
        }),
        alias: Some("#1/1".to_string()),
        updates: vec![],
    });
    let counter_note = TelemetryMessage::Notification(Notification {
        timestamp: 0,
        prefix: Some(Path::from_names(["#1/1"])),
        alias: None,
        updates: vec![Update::uint(
            Path::from_names(["state", "counters", "in-pkts"]),
            100,
        )],
    });
    let batch = vec![sync_marker(), alias_note.clone(), counter_note.clone()];

    let mut client =
        DialoutClient::new(&address, ClientOptions::new().with_insecure(true)).unwrap();
    client.send(&batch).unwrap();

    let received = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(received, batch);

    // Spot-check the structured content survived intact.
    match &received[1] {
        TelemetryMessage::Notification(n) => {
            assert_eq!(n.alias.as_deref(), Some("#1/1"));
            let prefix = n.prefix.as_ref().unwrap();
            assert_eq!(
                prefix.elems[1].keys.get("name").map(String::as_str),
                Some("1/1")
            );
        }
        other => panic!("expected notification, got {other:?}"),
    }
    match &received[2] {
        TelemetryMessage::Notification(n) => {
            assert_eq!(
                n.updates[0].value,
                dialout_common::TypedValue::Uint(100)
            );
        }
        other => panic!("expected notification, got {other:?}"),
    }

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn send_after_close_fails_and_close_is_idempotent() {
    init_logging();
    let (server, _rx, address) = start_server(ServerOptions::new().with_insecure(true));

    let mut client =
        DialoutClient::new(&address, ClientOptions::new().with_insecure(true)).unwrap();
    client.close().unwrap();

    let err = client.send(&[sync_marker()]).unwrap_err();
    assert!(matches!(err, DialoutError::Closed));

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn mismatched_trust_anchor_fails_the_handshake() {
    init_logging();
    // Verifying client with a CA that did not sign the server certificate
    // sees a transport-level handshake failure, not a hang.
    let options = ServerOptions::new()
        .with_skip_verify(true)
        .with_cert_file(tls_path("server.crt"))
        .with_key_file(tls_path("server.key"));
    let (server, _rx, address) = start_server(options);

    let err = DialoutClient::new(
        &address,
        ClientOptions::new()
            .with_server_name("collector.test")
            .with_ca_file(tls_path("client.crt")), // a leaf, not the CA
    )
    .unwrap_err();
    assert!(matches!(err, DialoutError::Transport(_)), "{err}");

    server.close().unwrap();
}
