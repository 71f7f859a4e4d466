//! Full relay-fabric tests: a real broker plus two real agent stacks
//! (control link, dispatcher, rule manager), tunneling TCP through the
//! relay forwarder on the entry side and the exit handler on the far side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_agent::dispatch::Dispatcher;
use lattice_agent::forwarder::{ForwarderSettings, RelayForwarder, StatusFn};
use lattice_agent::link::{ControlLink, LinkConfig};
use lattice_agent::rules::{Rule, RuleKind, RuleManager};
use lattice_broker::{build_router, router, AppState};
use lattice_protocol::TrafficStats;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

async fn spawn_broker() -> (String, AppState) {
    let state = AppState::new();
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (format!("ws://{addr}/ws"), state)
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

fn settings() -> ForwarderSettings {
    ForwarderSettings {
        buffer_size: 32 * 1024,
        connect_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(300),
    }
}

struct AgentStack {
    link: Arc<ControlLink>,
    rules: Arc<RuleManager>,
    traffic: Arc<TrafficStats<String>>,
    refresh_rx: mpsc::Receiver<()>,
    _status_rx: mpsc::UnboundedReceiver<lattice_agent::rules::StatusEvent>,
}

async fn spawn_agent(base: &str, id: &str) -> AgentStack {
    let (link, inbound) = ControlLink::start(LinkConfig {
        agent_id: id.to_string(),
        endpoint: base.to_string(),
        reconnect_initial: Duration::from_millis(200),
        reconnect_max: Duration::from_secs(1),
    });
    let traffic = Arc::new(TrafficStats::new());
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let rules = RuleManager::new(link.clone(), traffic.clone(), settings(), status_tx);
    let (refresh_tx, refresh_rx) = mpsc::channel(1);
    let dispatcher = Dispatcher::new(link.clone(), rules.clone(), settings(), refresh_tx);
    tokio::spawn(dispatcher.run(inbound));

    for _ in 0..100 {
        if link.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(link.is_connected(), "agent {id} failed to reach the broker");

    AgentStack {
        link,
        rules,
        traffic,
        refresh_rx,
        _status_rx: status_rx,
    }
}

fn relay_forwarder(entry: &AgentStack, exit_agent: &str, exit_addr: String) -> Arc<RelayForwarder> {
    let status: StatusFn = Arc::new(|_, _, _| {});
    RelayForwarder::new(
        "r-relay".into(),
        "127.0.0.1:0".into(),
        exit_addr,
        vec![exit_agent.to_string()],
        entry.link.clone(),
        settings(),
        entry.traffic.clone(),
        status,
    )
}

#[tokio::test]
async fn relay_echo_round_trip() {
    let (base, state) = spawn_broker().await;
    let a = spawn_agent(&base, "agent-a").await;
    let _b = spawn_agent(&base, "agent-b").await;
    let echo = spawn_echo().await;

    let forwarder = relay_forwarder(&a, "agent-b", echo.to_string());
    forwarder.clone().start().await.unwrap();
    let addr = forwarder.local_addr().unwrap();

    let sent = b"Hello from Client A!";
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(sent).await.unwrap();
    let mut back = vec![0u8; sent.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut back))
        .await
        .expect("echo through the tunnel")
        .unwrap();
    assert_eq!(&back, sent);
    drop(client);

    // Entry-side accounting: both directions attributed to the relay rule.
    for _ in 0..100 {
        if a.traffic.active_conns(&"r-relay".to_string()) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let rows = a.traffic.snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, "r-relay");
    assert_eq!(rows[0].bytes_out, sent.len() as u64);
    assert_eq!(rows[0].bytes_in, sent.len() as u64);
    assert_eq!(rows[0].connections, 1);

    forwarder.stop().await;

    // Both sides tore the stream down and the broker swept the route.
    for _ in 0..100 {
        if state.routes.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(state.routes.is_empty());
}

#[tokio::test]
async fn one_mebibyte_chunked_transfer() {
    let (base, _state) = spawn_broker().await;
    let a = spawn_agent(&base, "bulk-a").await;
    let _b = spawn_agent(&base, "bulk-b").await;
    let echo = spawn_echo().await;

    let forwarder = relay_forwarder(&a, "bulk-b", echo.to_string());
    forwarder.clone().start().await.unwrap();
    let addr = forwarder.local_addr().unwrap();

    let mut payload = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let started = Instant::now();
    let client = TcpStream::connect(addr).await.unwrap();
    let (mut rd, mut wr) = client.into_split();

    let expected = payload.clone();
    let reader = tokio::spawn(async move {
        let mut received = vec![0u8; expected.len()];
        rd.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected, "echoed bytes must match exactly");
    });

    wr.write_all(&payload).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), reader)
        .await
        .expect("1 MiB round trip within 10s")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    forwarder.stop().await;
}

#[tokio::test]
async fn tunnel_refused_when_exit_dial_fails() {
    let (base, _state) = spawn_broker().await;
    let a = spawn_agent(&base, "fail-a").await;
    let _b = spawn_agent(&base, "fail-b").await;

    // Nothing listens on the exit address; the exit handler's dial fails
    // and the handshake error closes the local socket.
    let forwarder = relay_forwarder(&a, "fail-b", "127.0.0.1:1".to_string());
    forwarder.clone().start().await.unwrap();
    let addr = forwarder.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("socket should close after the refused handshake")
        .unwrap();
    assert_eq!(n, 0);

    forwarder.stop().await;
}

#[tokio::test]
async fn tunnel_times_out_when_exit_agent_is_offline() {
    let (base, _state) = spawn_broker().await;
    let a = spawn_agent(&base, "lone-a").await;

    let forwarder = relay_forwarder(&a, "ghost", "127.0.0.1:1".to_string());
    forwarder.clone().start().await.unwrap();
    let addr = forwarder.local_addr().unwrap();

    // The broker answers with Error("offline"); the entry side aborts.
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("socket should close")
        .unwrap();
    assert_eq!(n, 0);

    forwarder.stop().await;
}

#[tokio::test]
async fn rule_update_push_reaches_the_refresh_channel() {
    let (base, state) = spawn_broker().await;
    let mut a = spawn_agent(&base, "push-a").await;

    assert!(router::notify_rule_update(&state, "push-a"));
    let nudge = tokio::time::timeout(Duration::from_secs(2), a.refresh_rx.recv())
        .await
        .expect("refresh nudge within 2s");
    assert!(nudge.is_some());
}

#[tokio::test]
async fn port_check_honours_the_owning_rule_exemption() {
    let (base, state) = spawn_broker().await;
    let a = spawn_agent(&base, "check-a").await;

    // Reserve an address, free it, then install a direct rule on it.
    let listen_addr = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().to_string()
    };
    let echo = spawn_echo().await;
    a.rules
        .apply(&[Rule {
            id: "r-direct".into(),
            kind: RuleKind::Direct,
            listen_addr: listen_addr.clone(),
            target_addr: echo.to_string(),
            exit_addr: String::new(),
            relay_chain: vec![],
        }])
        .await;

    // The rule holding the port reports it available.
    let owned = router::check_port(&state, "check-a", &listen_addr, "r-direct", Duration::from_secs(2)).await;
    assert_eq!(owned, "");

    // Any other rule sees the port as taken.
    let foreign =
        router::check_port(&state, "check-a", &listen_addr, "r-other", Duration::from_secs(2)).await;
    assert!(!foreign.is_empty(), "bound port must report unavailable");

    a.rules.stop_all().await;
}
