//! Multi-node scenarios over loopback TCP

use nodemesh_core::{NodeInfo, RequestTarget, Response, ResponseStatus};
use nodemesh_net::{handshake, EventKind, Node, NodeConfig, NodeError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout, Instant};

const LOCALHOST: &str = "127.0.0.1";

fn quick_config() -> NodeConfig {
    NodeConfig {
        request_timeout_ms: 2_000,
        handshake_timeout_ms: 2_000,
        ..NodeConfig::default()
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn echo_567(node: &Node) {
    node.set_request_handler(|_payload: Vec<u8>| Some(vec![5, 6, 7]));
}

#[tokio::test]
async fn test_unaddressed_request_answered_by_direct_peer() {
    let a = Node::with_config("A", quick_config()).unwrap();
    echo_567(&a);
    let addr = a.start_listener(0).await.unwrap();

    let b = Node::with_config("B", quick_config()).unwrap();
    let remote = b.connect(LOCALHOST, addr.port()).await.unwrap();
    assert_eq!(remote.name, "A");
    assert_eq!(remote.id, a.info().id);
    assert!(remote.endpoint.is_some());

    let response = b.send(vec![1, 2, 3], RequestTarget::Unspecified).await;
    assert_eq!(response, Response::new(ResponseStatus::Success, vec![5, 6, 7]));
}

#[tokio::test]
async fn test_request_forwarded_through_hub() {
    let a = Node::with_config("A", quick_config()).unwrap();
    let mut events = a.subscribe();
    let addr = a.start_listener(0).await.unwrap();

    let b = Node::with_config("B", quick_config()).unwrap();
    let c = Node::with_config("C", quick_config()).unwrap();
    echo_567(&c);
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    c.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("hub to see both peers", || a.connected_node_info().len() == 2).await;

    let response = b.send(vec![1, 2, 3], "C").await;
    assert_eq!(response, Response::new(ResponseStatus::Success, vec![5, 6, 7]));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::ForwardRequest));
    assert!(kinds.contains(&EventKind::ForwardResponse));
}

#[tokio::test]
async fn test_request_forwarded_by_id() {
    let a = Node::with_config("A", quick_config()).unwrap();
    let addr = a.start_listener(0).await.unwrap();

    let b = Node::with_config("B", quick_config()).unwrap();
    let c = Node::with_config("C", quick_config()).unwrap();
    c.set_request_handler(|payload: Vec<u8>| Some(payload.into_iter().rev().collect::<Vec<u8>>()));
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    c.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("hub to see both peers", || a.connected_node_info().len() == 2).await;

    let response = b.send(vec![1, 2, 3], c.info().id).await;
    assert_eq!(response, Response::new(ResponseStatus::Success, vec![3, 2, 1]));
}

#[tokio::test]
async fn test_forward_times_out_at_hub() {
    let a = Node::with_config(
        "A",
        NodeConfig {
            request_timeout_ms: 200,
            ..quick_config()
        },
    )
    .unwrap();
    let mut events = a.subscribe();
    let addr = a.start_listener(0).await.unwrap();

    // C never answers
    let b = Node::with_config("B", quick_config()).unwrap();
    let c = Node::with_config("C", quick_config()).unwrap();
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    c.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("hub to see both peers", || a.connected_node_info().len() == 2).await;

    let started = Instant::now();
    let response = b.send(vec![1, 2, 3], "C").await;
    assert_eq!(response.status, ResponseStatus::Timeout);
    assert!(response.data.is_empty());
    // Answered by the hub, well before B's own 2s limit
    assert!(started.elapsed() < Duration::from_millis(1_500));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::ForwardError));
    assert_eq!(b.connected_node_info().len(), 1);
}

#[tokio::test]
async fn test_next_hop_closing_mid_forward_is_unknown_error() {
    let a = Node::with_config("A", quick_config()).unwrap();
    let addr = a.start_listener(0).await.unwrap();

    let b = Node::with_config("B", quick_config()).unwrap();
    let c = Node::with_config("C", quick_config()).unwrap();
    let entered = Arc::new(AtomicBool::new(false));
    let flag = entered.clone();
    c.set_request_handler(move |payload: Vec<u8>| {
        flag.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(500));
        Some(payload)
    });
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    c.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("hub to see both peers", || a.connected_node_info().len() == 2).await;

    let started = Instant::now();
    let (response, ()) = tokio::join!(b.send(vec![1], "C"), async {
        wait_until("C to start handling", || entered.load(Ordering::SeqCst)).await;
        c.shutdown();
    });

    assert_eq!(response.status, ResponseStatus::UnknownError);
    assert!(started.elapsed() < Duration::from_millis(1_500));
    wait_until("hub to drop C", || a.connected_node_info().len() == 1).await;
}

#[tokio::test]
async fn test_bad_target_name_keeps_link() {
    let a = Node::with_config("A", quick_config()).unwrap();
    echo_567(&a);
    let addr = a.start_listener(0).await.unwrap();
    let b = Node::with_config("B", quick_config()).unwrap();
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("link on A", || a.connected_node_info().len() == 1).await;

    let response = b.send(vec![1], RequestTarget::Name("n\u{f6}de".into())).await;
    assert_eq!(response.status, ResponseStatus::ResolveFailure);
    let response = b.send(vec![1], RequestTarget::Name("n".repeat(255))).await;
    assert_eq!(response.status, ResponseStatus::ResolveFailure);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(b.connected_node_info().len(), 1);
    assert_eq!(a.connected_node_info().len(), 1);
    let response = b.send(vec![1], RequestTarget::Unspecified).await;
    assert_eq!(response, Response::new(ResponseStatus::Success, vec![5, 6, 7]));
}

#[tokio::test]
async fn test_partial_frame_stall_drops_peer() {
    let a = Node::with_config(
        "A",
        NodeConfig {
            io_timeout_ms: 50,
            ..quick_config()
        },
    )
    .unwrap();
    let addr = a.start_listener(0).await.unwrap();

    // Handshake as a bare peer, then send half a request header and stall
    let mut raw = TcpStream::connect((LOCALHOST, addr.port())).await.unwrap();
    let local = NodeInfo::local("X").unwrap();
    handshake::initiate(&mut raw, &local, Duration::from_secs(2))
        .await
        .unwrap();
    wait_until("link on A", || a.connected_node_info().len() == 1).await;

    raw.write_all(&[0, 1, 0]).await.unwrap();
    let started = Instant::now();
    wait_until("A to drop the stalled peer", || a.connected_node_info().is_empty()).await;
    // The idle limit is 30s; the stall is caught by the read timeout
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_connect_is_bounded_by_handshake_timeout() {
    // Fill a zero-backlog listener so further SYNs go unanswered
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind((LOCALHOST.parse::<std::net::IpAddr>().unwrap(), 0).into()).unwrap();
    let listener = socket.listen(0).unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut fillers = Vec::new();
    for _ in 0..4 {
        if let Ok(Ok(stream)) =
            timeout(Duration::from_millis(200), TcpStream::connect((LOCALHOST, port))).await
        {
            fillers.push(stream);
        }
    }

    let b = Node::with_config(
        "B",
        NodeConfig {
            handshake_timeout_ms: 300,
            ..quick_config()
        },
    )
    .unwrap();
    let started = Instant::now();
    let err = b.connect(LOCALHOST, port).await.unwrap_err();
    assert!(
        matches!(err, NodeError::ConnectTimeout(_) | NodeError::Handshake(_)),
        "{}",
        err
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(b.connected_node_info().is_empty());
    drop(listener);
}

#[tokio::test]
async fn test_hub_lists_connected_nodes() {
    let a = Node::with_config("A", quick_config()).unwrap();
    let addr = a.start_listener(0).await.unwrap();

    let b = Node::with_config("B", quick_config()).unwrap();
    let c = Node::with_config("C", quick_config()).unwrap();
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    c.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("hub to see both peers", || a.connected_node_info().len() == 2).await;

    let mut names: Vec<_> = a
        .connected_node_info()
        .into_iter()
        .map(|info| info.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["B", "C"]);
    assert_eq!(b.connected_node_info().len(), 1);
}

#[tokio::test]
async fn test_request_without_responder_times_out() {
    let a = Node::with_config("A", quick_config()).unwrap();
    let addr = a.start_listener(0).await.unwrap();

    let b = Node::with_config(
        "B",
        NodeConfig {
            request_timeout_ms: 300,
            ..quick_config()
        },
    )
    .unwrap();
    b.connect(LOCALHOST, addr.port()).await.unwrap();

    let started = Instant::now();
    let response = b.send(vec![1, 2, 3], RequestTarget::Unspecified).await;
    assert_eq!(response.status, ResponseStatus::Timeout);
    assert!(response.data.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_unresolvable_target_reports_resolve_failure() {
    let a = Node::with_config("A", quick_config()).unwrap();
    let addr = a.start_listener(0).await.unwrap();

    let b = Node::with_config("B", quick_config()).unwrap();
    let c = Node::with_config("C", quick_config()).unwrap();
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    c.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("hub to see both peers", || a.connected_node_info().len() == 2).await;

    let response = b.send(vec![1], "Z").await;
    assert_eq!(response.status, ResponseStatus::ResolveFailure);

    // With two links, the hub itself cannot pick one for an unknown name
    let response = a.send(vec![1], "Z").await;
    assert_eq!(response.status, ResponseStatus::ResolveFailure);
}

#[tokio::test]
async fn test_keepalives_hold_idle_link_open() {
    let config = NodeConfig {
        keepalive_interval_ms: 100,
        idle_timeout_ms: 400,
        io_timeout_ms: 50,
        ..quick_config()
    };
    let a = Node::with_config("A", config.clone()).unwrap();
    echo_567(&a);
    let addr = a.start_listener(0).await.unwrap();
    let b = Node::with_config("B", config).unwrap();
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("link on A", || a.connected_node_info().len() == 1).await;

    sleep(Duration::from_millis(1_000)).await;

    assert_eq!(a.connected_node_info().len(), 1);
    assert_eq!(b.connected_node_info().len(), 1);
    let response = b.send(vec![1], RequestTarget::Unspecified).await;
    assert!(response.is_success());
}

#[tokio::test]
async fn test_silent_peer_is_dropped() {
    let a = Node::with_config(
        "A",
        NodeConfig {
            keepalive_interval_ms: 100,
            idle_timeout_ms: 300,
            io_timeout_ms: 50,
            ..quick_config()
        },
    )
    .unwrap();
    let mut events = a.subscribe();
    let addr = a.start_listener(0).await.unwrap();

    let b = Node::with_config(
        "B",
        NodeConfig {
            keepalive_interval_ms: 0,
            ..quick_config()
        },
    )
    .unwrap();
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("link on A", || a.connected_node_info().len() == 1).await;

    wait_until("A to drop B", || a.connected_node_info().is_empty()).await;
    wait_until("B to notice", || b.connected_node_info().is_empty()).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::NetTimeout));
    assert!(kinds.contains(&EventKind::RemoveClient));
}

#[tokio::test]
async fn test_connect_fails_on_bad_greeting() {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let impostor = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 8];
        stream.read_exact(&mut greeting).await.unwrap();
        let mut reply = 4u16.to_le_bytes().to_vec();
        reply.extend_from_slice(b"nope");
        stream.write_all(&reply).await.unwrap();
        stream
    });

    let b = Node::with_config("B", quick_config()).unwrap();
    let err = b.connect(LOCALHOST, port).await.unwrap_err();
    assert!(matches!(err, NodeError::Handshake(_)));
    assert!(b.connected_node_info().is_empty());
    drop(impostor.await.unwrap());
}

#[tokio::test]
async fn test_shutdown_closes_peers() {
    let a = Node::with_config("A", quick_config()).unwrap();
    let addr = a.start_listener(0).await.unwrap();
    let b = Node::with_config("B", quick_config()).unwrap();
    b.connect(LOCALHOST, addr.port()).await.unwrap();
    wait_until("link on A", || a.connected_node_info().len() == 1).await;

    a.shutdown();
    assert!(a.connected_node_info().is_empty());
    wait_until("B to notice", || b.connected_node_info().is_empty()).await;

    let response = b.send(vec![1], RequestTarget::Unspecified).await;
    assert_eq!(response.status, ResponseStatus::ResolveFailure);
}

#[test]
fn test_invalid_name_rejected() {
    assert!(matches!(Node::new(""), Err(NodeError::InvalidName(_))));
    assert!(matches!(
        Node::with_config(
            "A",
            NodeConfig {
                io_timeout_ms: 0,
                ..NodeConfig::default()
            }
        ),
        Err(NodeError::Config(_))
    ));
}
