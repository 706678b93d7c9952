use std::time::{Duration, Instant};

use driftwood_tracker::{
    AnnounceEvent, AnnounceOutcome, PeerAddr, Rerequester, RerequesterConfig, SwarmHooks,
    TrackerClient,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Default)]
struct Swarm {
    connected: Vec<PeerAddr>,
}

impl SwarmHooks for Swarm {
    fn peer_count(&self) -> usize {
        self.connected.len()
    }
    fn ever_got_incoming(&self) -> bool {
        false
    }
    fn amount_left(&self) -> u64 {
        1024
    }
    fn uploaded(&self) -> u64 {
        0
    }
    fn downloaded(&self) -> u64 {
        0
    }
    fn connect(&mut self, peers: Vec<PeerAddr>) {
        self.connected.extend(peers);
    }
}

async fn serve_once(listener: TcpListener, status: &'static str, body: Vec<u8>) -> String {
    let Ok((mut socket, _)) = listener.accept().await else {
        return String::new();
    };
    let mut request = vec![0_u8; 4096];
    let read = socket.read(&mut request).await.unwrap_or(0);
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = socket.write_all(head.as_bytes()).await;
    let _ = socket.write_all(&body).await;
    String::from_utf8_lossy(&request[..read]).into_owned()
}

#[tokio::test]
async fn announce_round_trip_feeds_the_state_machine() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let mut body = b"d8:intervali600e5:peers6:".to_vec();
    body.extend_from_slice(&[127, 0, 0, 1, 0x1f, 0x90, b'e']);
    let server = tokio::spawn(serve_once(listener, "200 OK", body));

    let mut rr = Rerequester::new(
        format!("http://{addr}/announce"),
        [4; 20],
        *b"-DW0100-cccccccccccc",
        6881,
        RerequesterConfig::default(),
        Swarm::default(),
    );
    let now = Instant::now();
    let request = rr.check(now).ok_or_else(|| anyhow::anyhow!("no announce"))?;
    assert_eq!(request.event, Some(AnnounceEvent::Started));

    let client = TrackerClient::new(Duration::from_secs(5), None)?;
    let body = client.announce(&request.url).await.map_err(|err| err.to_string());
    let outcome = rr.handle_outcome(request.identity, body, now);
    assert_eq!(
        outcome,
        AnnounceOutcome::Success {
            peers: 1,
            warning: None
        }
    );
    let seen = server.await?;
    assert!(seen.starts_with("GET /announce?info_hash="));
    assert!(seen.contains("event=started"));
    Ok(())
}

#[tokio::test]
async fn http_errors_enter_backoff() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(serve_once(listener, "503 Service Unavailable", Vec::new()));

    let mut rr = Rerequester::new(
        format!("http://{addr}/announce"),
        [4; 20],
        *b"-DW0100-dddddddddddd",
        6881,
        RerequesterConfig::default(),
        Swarm::default(),
    );
    let now = Instant::now();
    let request = rr.check(now).ok_or_else(|| anyhow::anyhow!("no announce"))?;
    let client = TrackerClient::new(Duration::from_secs(5), None)?;
    let body = client.announce(&request.url).await.map_err(|err| err.to_string());
    assert!(body.is_err());
    assert!(matches!(
        rr.handle_outcome(request.identity, body, now),
        AnnounceOutcome::Failed { .. }
    ));
    assert_eq!(rr.fail_wait(), Some(Duration::from_secs(50)));
    server.await?;
    Ok(())
}
