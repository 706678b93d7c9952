use std::path::Path;

use driftwood_config::{FileConfigStore, Settings};
use driftwood_core::ContentId;
use driftwood_daemon::{
    DaemonChannels, LogRenderer, Orchestrator, OrchestratorDeps, TrackerRuntime, WatchDirScanner,
    serve,
};
use driftwood_ipc::{
    Command, CommandKind, CommandPayload, Decoded, WorkerSet, decode, spawn_transport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn serve_once(listener: TcpListener, body: &'static [u8]) -> String {
    let Ok((mut socket, _)) = listener.accept().await else {
        return String::new();
    };
    let mut request = vec![0_u8; 4096];
    let read = socket.read(&mut request).await.unwrap_or(0);
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = socket.write_all(head.as_bytes()).await;
    let _ = socket.write_all(body).await;
    String::from_utf8_lossy(&request[..read]).into_owned()
}

fn write_descriptor(dir: &Path, id: ContentId, announce: &str) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "content_id": id.to_string(),
        "name": "rejected",
        "length": 1024,
        "announce": announce,
    });
    std::fs::write(dir.join("rejected.dl.json"), serde_json::to_vec(&body)?)?;
    Ok(())
}

async fn next_command(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> anyhow::Result<Command> {
    loop {
        let Some(frame) = rx.recv().await else {
            anyhow::bail!("daemon closed the channel");
        };
        if let Decoded::Known(command) = decode(&frame)? {
            return Ok(command);
        }
    }
}

#[tokio::test]
async fn tracker_rejection_fails_a_scanned_download() -> anyhow::Result<()> {
    let tracker = TcpListener::bind("127.0.0.1:0").await?;
    let addr = tracker.local_addr()?;
    let tracker_task = tokio::spawn(serve_once(tracker, b"d14:failure reason6:bannede"));

    let root = tempfile::tempdir()?;
    let watch_dir = root.path().join("watch");
    let download_dir = root.path().join("downloads");
    std::fs::create_dir_all(&watch_dir)?;
    std::fs::create_dir_all(&download_dir)?;
    let content_id = ContentId::from_bytes([7; 20]);
    write_descriptor(&watch_dir, content_id, &format!("http://{addr}/announce"))?;

    let settings = Settings {
        watch_dir,
        download_dir,
        ..Settings::default()
    };
    let store = FileConfigStore::new(root.path().join("config.json"));
    let workers = WorkerSet::new();
    let (events_tx, events) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(OrchestratorDeps {
        runtime: TrackerRuntime::new(workers.clone()),
        scanner: Box::new(WatchDirScanner::default()),
        renderer: Box::new(LogRenderer),
        settings,
        events: events_tx,
    });

    let (connections_tx, connections) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (_signals_tx, signals) = mpsc::unbounded_channel();
    let (daemon_side, app_side) = tokio::io::duplex(64 * 1024);
    let (daemon_read, daemon_write) = tokio::io::split(daemon_side);
    let (app_read, app_write) = tokio::io::split(app_side);
    let (daemon_sender, _daemon_tasks) = spawn_transport(daemon_read, daemon_write, inbound_tx);
    let (app_inbound, mut app_rx) = mpsc::unbounded_channel();
    let (app, _app_tasks) = spawn_transport(app_read, app_write, app_inbound);
    connections_tx.send(daemon_sender)?;

    let application = async {
        let error = loop {
            let command = next_command(&mut app_rx).await?;
            if let CommandPayload::DownloaderError {
                content_id: Some(id),
                message,
                ..
            } = command.payload
            {
                break (id, message);
            }
        };
        let request = Command::new(CommandPayload::Shutdown);
        app.send(&request);
        let ack = loop {
            let command = next_command(&mut app_rx).await?;
            if command.kind() == CommandKind::ShutdownAck {
                break command;
            }
        };
        anyhow::ensure!(ack.in_reply_to == Some(request.id), "ack answers another request");
        Ok::<_, anyhow::Error>(error)
    };

    let channels = DaemonChannels {
        connections,
        inbound,
        events,
        signals,
    };
    let (report, outcome) = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        tokio::join!(serve(orchestrator, &store, &workers, channels), application)
    })
    .await?;

    let (failed_id, message) = outcome?;
    assert_eq!(failed_id, content_id);
    assert_eq!(message, "download failed");
    assert_eq!(report.abandoned, 0);

    let request = tracker_task.await?;
    assert!(request.starts_with("GET /announce?"));
    assert!(request.contains("event=started"));
    Ok(())
}
