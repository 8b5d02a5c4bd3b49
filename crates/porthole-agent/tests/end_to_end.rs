//! End-to-end flows: a real hub, a real agent, and a real local service on
//! loopback sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use porthole_agent::{Agent, AgentConfig, AgentError, NullObserver};
use porthole_hub::{Hub, HubConfig, HubHandle};
use porthole_proto::http1::ResponseHead;
use porthole_proto::{RoutingMode, TunnelKind};

const SECRET: &str = "e2e-test-secret";
const BASE_DOMAIN: &str = "tunnel.example.com";

struct RunningHub {
    addr: std::net::SocketAddr,
    handle: HubHandle,
    task: tokio::task::JoinHandle<()>,
}

impl RunningHub {
    async fn stop(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}

async fn start_hub(routing_mode: RoutingMode, rate_limit: u32, tcp_range: (u16, u16)) -> RunningHub {
    let config = HubConfig {
        port: 0,
        secret: SECRET.into(),
        base_domain: BASE_DOMAIN.into(),
        routing_mode,
        tcp_port_start: tcp_range.0,
        tcp_port_end: tcp_range.1,
        rate_limit_per_minute: rate_limit,
    };
    let hub = Hub::bind(config).await.unwrap();
    let addr = hub.local_addr();
    let handle = hub.handle();
    let task = tokio::spawn(async move {
        hub.run().await.unwrap();
    });
    RunningHub { addr, handle, task }
}

/// A local HTTP server answering `200 hi` and reporting each raw request
/// head it saw.
async fn start_local_http(
    delay: Duration,
) -> (u16, mpsc::UnboundedReceiver<String>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let _ = seen_tx.send(String::from_utf8_lossy(&buf).into_owned());

                tokio::time::sleep(delay).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
                    .await;
            });
        }
    });

    (port, seen_rx, task)
}

async fn start_agent(config: AgentConfig) -> (Arc<Agent>, tokio::task::JoinHandle<Result<(), AgentError>>) {
    let agent = Arc::new(Agent::connect(config, Arc::new(NullObserver)).await.unwrap());
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };
    // Give the accept loop a beat to come up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (agent, runner)
}

fn agent_config(hub: &RunningHub, tenant: &str, local_port: u16) -> AgentConfig {
    AgentConfig {
        hub_url: format!("http://127.0.0.1:{}", hub.addr.port()),
        secret: SECRET.into(),
        tenant_id: tenant.into(),
        local_port,
        rewrite_host: true,
        ..AgentConfig::default()
    }
}

/// Issue one HTTP request against the hub, returning status, headers, body.
async fn http_request(
    hub: &RunningHub,
    host: &str,
    target: &str,
    extra_headers: &[(&str, &str)],
) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let mut socket = TcpStream::connect(hub.addr).await.unwrap();
    let mut request = format!("GET {target} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    socket.read_to_end(&mut raw).await.unwrap();
    let (head, body_start) = ResponseHead::parse(&raw).unwrap().unwrap();
    (head.code, head.headers.clone(), raw[body_start..].to_vec())
}

#[tokio::test(flavor = "multi_thread")]
async fn path_mode_round_trip_strips_prefix_and_sets_headers() {
    let hub = start_hub(RoutingMode::Path, 0, (19000, 19004)).await;
    let (local_port, mut seen, local) = start_local_http(Duration::ZERO).await;

    let (agent, runner) = start_agent(agent_config(&hub, "myapp", local_port)).await;
    assert_eq!(agent.public_url(), "https://tunnel.example.com/myapp/");

    let (status, headers, body) =
        http_request(&hub, BASE_DOMAIN, "/myapp/foo", &[]).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hi");

    // Path-resolved requests get the routing cookie.
    let cookie = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
        .map(|(_, value)| value.clone())
        .expect("routing cookie missing");
    assert!(cookie.starts_with("x-tunnel=myapp"));

    let observed = seen.recv().await.unwrap();
    assert!(observed.starts_with("GET /foo HTTP/1.1\r\n"), "{observed}");
    assert!(observed.contains(&format!("Host: 127.0.0.1:{local_port}\r\n")), "{observed}");
    assert!(observed.contains("X-Forwarded-Host: tunnel.example.com\r\n"), "{observed}");
    assert!(observed.contains("X-Forwarded-Proto: https\r\n"), "{observed}");

    agent.shutdown();
    runner.await.unwrap().unwrap();
    local.abort();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cookie_routes_requests_without_a_prefix() {
    let hub = start_hub(RoutingMode::Path, 0, (19010, 19014)).await;
    let (local_port, mut seen, local) = start_local_http(Duration::ZERO).await;
    let (agent, runner) = start_agent(agent_config(&hub, "myapp", local_port)).await;

    let (status, _, body) = http_request(
        &hub,
        BASE_DOMAIN,
        "/assets/style.css",
        &[("Cookie", "x-tunnel=myapp")],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hi");

    // No prefix in the path, so nothing was stripped.
    let observed = seen.recv().await.unwrap();
    assert!(observed.starts_with("GET /assets/style.css HTTP/1.1\r\n"), "{observed}");

    agent.shutdown();
    runner.await.unwrap().unwrap();
    local.abort();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subdomain_mode_routes_by_host() {
    let hub = start_hub(RoutingMode::Subdomain, 0, (19020, 19024)).await;
    let (local_port, mut seen, local) = start_local_http(Duration::ZERO).await;
    let (agent, runner) = start_agent(agent_config(&hub, "bold-owl-716", local_port)).await;
    assert_eq!(agent.public_url(), "https://bold-owl-716.tunnel.example.com");

    let (status, _, body) = http_request(
        &hub,
        "bold-owl-716.tunnel.example.com",
        "/api/users",
        &[],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hi");

    let observed = seen.recv().await.unwrap();
    assert!(observed.starts_with("GET /api/users HTTP/1.1\r\n"), "{observed}");

    // Unknown hosts are not routed.
    let (status, _, _) = http_request(&hub, "other.zzz", "/api/users", &[]).await;
    assert_eq!(status, 404);

    agent.shutdown();
    runner.await.unwrap().unwrap();
    local.abort();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_agent_for_the_same_tenant_is_rejected() {
    let hub = start_hub(RoutingMode::Path, 0, (19030, 19034)).await;
    let (local_port, _seen, local) = start_local_http(Duration::ZERO).await;
    let (agent, runner) = start_agent(agent_config(&hub, "shared", local_port)).await;

    let err = Agent::connect(agent_config(&hub, "shared", local_port), Arc::new(NullObserver))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::TenantTaken(id) if id == "shared"));

    agent.shutdown();
    runner.await.unwrap().unwrap();
    local.abort();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limit_denies_the_61st_request_then_recovers() {
    let hub = start_hub(RoutingMode::Path, 60, (19040, 19044)).await;
    let (local_port, _seen, local) = start_local_http(Duration::ZERO).await;
    let (agent, runner) = start_agent(agent_config(&hub, "myapp", local_port)).await;

    for i in 0..60 {
        let (status, _, _) = http_request(&hub, BASE_DOMAIN, "/myapp/", &[]).await;
        assert_eq!(status, 200, "request {i} should pass");
    }

    let (status, _, _) = http_request(&hub, BASE_DOMAIN, "/myapp/", &[]).await;
    assert_eq!(status, 429);

    // 60/min refills one token per second.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let (status, _, _) = http_request(&hub, BASE_DOMAIN, "/myapp/", &[]).await;
    assert_eq!(status, 200);

    agent.shutdown();
    runner.await.unwrap().unwrap();
    local.abort();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_tunnel_bridges_raw_bytes() {
    let hub = start_hub(RoutingMode::Path, 0, (19050, 19054)).await;

    // Local echo server.
    let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = echo_listener.local_addr().unwrap().port();
    let echo = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = echo_listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let config = AgentConfig {
        kind: TunnelKind::Tcp,
        rewrite_host: false,
        ..agent_config(&hub, "db", echo_port)
    };
    let (agent, runner) = start_agent(config).await;

    // First port of the range, reported through the handshake header.
    assert_eq!(agent.tcp_port(), Some(19050));
    assert_eq!(agent.public_url(), "tcp://tunnel.example.com:19050");

    let mut client = TcpStream::connect(("127.0.0.1", 19050)).await.unwrap();
    client.write_all(b"ABC").await.unwrap();
    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ABC");
    drop(client);

    agent.shutdown();
    runner.await.unwrap().unwrap();
    echo.abort();
    hub.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_lets_in_flight_requests_finish() {
    let hub = start_hub(RoutingMode::Path, 0, (19060, 19064)).await;
    // The local service replies after a delay shorter than the drain grace.
    let (local_port, _seen, local) = start_local_http(Duration::from_millis(500)).await;
    let (agent, runner) = start_agent(agent_config(&hub, "myapp", local_port)).await;

    let mut in_flight = Vec::new();
    for _ in 0..2 {
        let addr = hub.addr;
        in_flight.push(tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            socket
                .write_all(b"GET /myapp/slow HTTP/1.1\r\nHost: tunnel.example.com\r\n\r\n")
                .await
                .unwrap();
            let mut raw = Vec::new();
            let _ = socket.read_to_end(&mut raw).await;
            raw
        }));
    }

    // Let both requests reach the workers, then ask for shutdown.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let started = Instant::now();
    agent.shutdown();
    runner.await.unwrap().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "drain took {:?}",
        started.elapsed()
    );

    // Both workers were already past accept; they completed normally.
    for request in in_flight {
        let raw = request.await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200"), "{text}");
    }

    local.abort();
    hub.stop().await;
}
