//! Mutual-TLS peer transport tests.
//!
//! Uses the static test certificates under `tests/certs/`: one CA signing
//! the peer certificate (SAN `localhost` / `127.0.0.1`), and a second,
//! unrelated CA for the negative case.

use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dkv_kv::MemoryStore;
use dkv_raft::{ServerAddress, StreamLayer, TcpStreamLayer};
use dkv_server::{setup_client_tls, setup_server_tls};
use dkv_store::Store;
use tempfile::TempDir;

fn cert(name: &str) -> String {
    format!("{}/tests/certs/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn random_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

fn eventually(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// A TLS-enabled store advertising `localhost:<port>` so the SNI name
/// matches the test certificate.
fn tls_store(tmp: &TempDir, name: &str) -> Store {
    let port = random_port();
    let server_tls = setup_server_tls(&cert("peer.crt"), &cert("peer.key"), &cert("ca.crt"))
        .expect("server tls");
    let client_tls = setup_client_tls(&cert("peer.crt"), &cert("peer.key"), &cert("ca.crt"))
        .expect("client tls");
    Store::new(
        tmp.path(),
        format!("127.0.0.1:{port}"),
        name,
        format!("localhost:{port}"),
        Arc::new(MemoryStore::new()),
    )
    .with_server_tls(server_tls)
    .with_client_tls(client_tls)
}

#[test]
fn test_three_node_consensus_over_mutual_tls() {
    let tmps: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let mut stores: Vec<Arc<Store>> = Vec::new();

    for (i, tmp) in tmps.iter().enumerate() {
        let mut store = tls_store(tmp, &format!("node{i}"));
        store.open(i == 0).unwrap();
        let store = Arc::new(store);
        if i == 0 {
            store.wait_for_leader(Duration::from_secs(5)).unwrap();
        } else {
            stores[0]
                .join(format!("node{i}"), store.raft_advertise().clone())
                .unwrap();
        }
        stores.push(store);
    }

    stores[0].set("secure", "channel").unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            stores
                .iter()
                .all(|s| s.get("secure").map_or(false, |v| v == "channel"))
        }),
        "write did not replicate over TLS"
    );

    // Forwarded write over TLS from a follower.
    stores[2].set("via", "follower").unwrap();
    assert!(eventually(Duration::from_secs(10), || {
        stores
            .iter()
            .all(|s| s.get("via").map_or(false, |v| v == "follower"))
    }));

    for store in &stores {
        store.shutdown().unwrap();
    }
}

#[test]
fn test_dial_with_untrusted_ca_fails() {
    // Server trusts the real CA; the dialer only trusts the rogue CA, so
    // certificate verification must fail during the handshake.
    let port = random_port();
    let server_tls = setup_server_tls(&cert("peer.crt"), &cert("peer.key"), &cert("ca.crt"))
        .expect("server tls");
    let rogue_client_tls =
        setup_client_tls(&cert("rogue.crt"), &cert("rogue.key"), &cert("rogue-ca.crt"))
            .expect("rogue client tls");

    let server = Arc::new(
        TcpStreamLayer::bind(
            &format!("127.0.0.1:{port}"),
            Some(ServerAddress::new(format!("localhost:{port}"))),
            Some(server_tls),
            None,
        )
        .expect("bind server layer"),
    );
    let accepting = Arc::clone(&server);
    let acceptor = std::thread::spawn(move || {
        // The handshake runs lazily; reading drives it to the failure.
        if let Ok(mut conn) = accepting.accept() {
            let mut buf = [0u8; 16];
            let _ = std::io::Read::read(&mut conn, &mut buf);
        }
    });

    let dialer = TcpStreamLayer::bind(
        "127.0.0.1:0",
        None,
        None,
        Some(rogue_client_tls),
    )
    .expect("bind dialer layer");

    let result = dialer
        .dial(
            &ServerAddress::new(format!("localhost:{port}")),
            Duration::from_secs(2),
        )
        .and_then(|mut conn| {
            conn.set_read_timeout(Some(Duration::from_secs(2)))?;
            conn.write_all(b"hello")?;
            conn.flush()?;
            let mut buf = [0u8; 16];
            std::io::Read::read(&mut conn, &mut buf)
        });
    assert!(result.is_err(), "handshake with untrusted CA must fail");

    server.close();
    let _ = acceptor.join();
}
