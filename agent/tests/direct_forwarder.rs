//! Direct forwarder end-to-end: echo through the proxy, traffic
//! accounting, status callbacks and the Stop contract.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lattice_agent::forwarder::{DirectForwarder, ForwarderSettings, RuleStatus, StatusFn};
use lattice_protocol::TrafficStats;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn settings() -> ForwarderSettings {
    ForwarderSettings {
        buffer_size: 32 * 1024,
        connect_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(300),
    }
}

fn noop_status() -> StatusFn {
    Arc::new(|_, _, _| {})
}

async fn spawn_echo() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = sock.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn echo_round_trip_with_accounting() {
    let echo = spawn_echo().await;
    let traffic = Arc::new(TrafficStats::<String>::new());
    let forwarder = DirectForwarder::new(
        "r1".into(),
        "127.0.0.1:0".into(),
        echo.to_string(),
        settings(),
        traffic.clone(),
        noop_status(),
    );
    forwarder.clone().start().await.unwrap();
    let addr = forwarder.local_addr().unwrap();

    let sent = b"Hello through direct forwarder!";
    assert_eq!(sent.len(), 31);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(sent).await.unwrap();
    let mut back = vec![0u8; sent.len()];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut back))
        .await
        .expect("echo within 2s")
        .unwrap();
    assert_eq!(&back, sent);
    drop(client);

    // Wait for the connection task to settle the active gauge.
    for _ in 0..100 {
        if traffic.active_conns(&"r1".to_string()) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let rows = traffic.snapshot();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.key, "r1");
    assert_eq!(row.bytes_in, 31);
    assert_eq!(row.bytes_out, 31);
    assert_eq!(row.connections, 1);
    assert_eq!(row.active, 0);

    forwarder.stop().await;
}

#[tokio::test]
async fn bind_failure_surfaces_through_status_callback() {
    // Occupy a port, then ask the forwarder to bind it.
    let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = holder.local_addr().unwrap();

    let events: Arc<Mutex<Vec<(String, RuleStatus, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let status: StatusFn = {
        let events = events.clone();
        Arc::new(move |rule_id, status, error| {
            events
                .lock()
                .unwrap()
                .push((rule_id.to_string(), status, error.to_string()));
        })
    };

    let forwarder = DirectForwarder::new(
        "r-bind".into(),
        taken.to_string(),
        "127.0.0.1:1".into(),
        settings(),
        Arc::new(TrafficStats::new()),
        status,
    );
    assert!(forwarder.clone().start().await.is_err());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "r-bind");
    assert_eq!(events[0].1, RuleStatus::Error);
    assert!(!events[0].2.is_empty());
}

#[tokio::test]
async fn stop_is_idempotent_before_and_after_start() {
    let echo = spawn_echo().await;

    // Stop before start.
    let forwarder = DirectForwarder::new(
        "r-early".into(),
        "127.0.0.1:0".into(),
        echo.to_string(),
        settings(),
        Arc::new(TrafficStats::new()),
        noop_status(),
    );
    forwarder.stop().await;
    forwarder.stop().await;

    // Stop after start, twice, then concurrently.
    let forwarder = DirectForwarder::new(
        "r-late".into(),
        "127.0.0.1:0".into(),
        echo.to_string(),
        settings(),
        Arc::new(TrafficStats::new()),
        noop_status(),
    );
    forwarder.clone().start().await.unwrap();
    let addr = forwarder.local_addr().unwrap();

    let f1 = forwarder.clone();
    let f2 = forwarder.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { f1.stop().await }),
        tokio::spawn(async move { f2.stop().await }),
    );
    a.unwrap();
    b.unwrap();
    forwarder.stop().await;

    // The listener is gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn stop_interrupts_in_flight_connections() {
    let echo = spawn_echo().await;
    let traffic = Arc::new(TrafficStats::<String>::new());
    let forwarder = DirectForwarder::new(
        "r-drain".into(),
        "127.0.0.1:0".into(),
        echo.to_string(),
        settings(),
        traffic.clone(),
        noop_status(),
    );
    forwarder.clone().start().await.unwrap();
    let addr = forwarder.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut back = [0u8; 4];
    client.read_exact(&mut back).await.unwrap();

    // Stop returns even though the client is still connected, and the
    // connection is torn down.
    tokio::time::timeout(Duration::from_secs(2), forwarder.stop())
        .await
        .expect("stop must not hang on open connections");
    assert_eq!(traffic.active_conns(&"r-drain".to_string()), 0);
}

#[tokio::test]
async fn dial_failure_closes_client_and_settles_gauge() {
    let traffic = Arc::new(TrafficStats::<String>::new());
    let forwarder = DirectForwarder::new(
        "r-dead".into(),
        "127.0.0.1:0".into(),
        // Nothing listens here; the dial fails immediately.
        "127.0.0.1:1".into(),
        settings(),
        traffic.clone(),
        noop_status(),
    );
    forwarder.clone().start().await.unwrap();
    let addr = forwarder.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("socket should close quickly")
        .unwrap();
    assert_eq!(n, 0, "client sees EOF when the target dial fails");

    for _ in 0..100 {
        if traffic.active_conns(&"r-dead".to_string()) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(traffic.active_conns(&"r-dead".to_string()), 0);

    forwarder.stop().await;
}
