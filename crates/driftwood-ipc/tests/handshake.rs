use std::time::Duration;

use driftwood_ipc::{
    Command, CommandKind, CommandPayload, DispatchOutcome, Dispatcher, ShutdownOutcome,
    WorkerSet, acknowledge_shutdown, request_shutdown, spawn_transport,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct DaemonSide {
    shutdown_requests: Vec<Command>,
}

#[tokio::test]
async fn shutdown_handshake_completes_with_stuck_workers() -> anyhow::Result<()> {
    let (app_stream, daemon_stream) = tokio::io::duplex(64 * 1024);

    let (app_read, app_write) = tokio::io::split(app_stream);
    let (app_inbound_tx, mut app_inbound) = mpsc::unbounded_channel();
    let (app_sender, app_tasks) = spawn_transport(app_read, app_write, app_inbound_tx);

    let (daemon_read, daemon_write) = tokio::io::split(daemon_stream);
    let (daemon_inbound_tx, mut daemon_inbound) = mpsc::unbounded_channel();
    let (daemon_sender, daemon_tasks) =
        spawn_transport(daemon_read, daemon_write, daemon_inbound_tx);

    let workers = WorkerSet::new();
    workers.spawn("stuck-announce", |_| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });

    let daemon = tokio::spawn(async move {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(CommandKind::Shutdown, |side: &mut DaemonSide, command| {
            side.shutdown_requests.push(command);
            Ok(())
        });
        let mut side = DaemonSide::default();
        while let Some(frame) = daemon_inbound.recv().await {
            assert_eq!(
                dispatcher.dispatch(&mut side, &frame),
                DispatchOutcome::Handled
            );
            if let Some(request) = side.shutdown_requests.pop() {
                assert!(!request.originated_here);
                return acknowledge_shutdown(
                    Some(&request),
                    &workers,
                    &daemon_sender,
                    Duration::from_millis(100),
                )
                .await;
            }
        }
        panic!("daemon inbound closed before shutdown");
    });

    let outcome = request_shutdown(&app_sender, &mut app_inbound, Duration::from_secs(5)).await;
    assert_eq!(outcome, ShutdownOutcome::Acknowledged);

    let report = daemon.await?;
    assert_eq!(report.abandoned, 1);

    app_tasks.abort();
    daemon_tasks.abort();
    Ok(())
}

#[tokio::test]
async fn shutdown_request_times_out_without_a_peer() {
    let (app_stream, _daemon_stream) = tokio::io::duplex(1024);
    let (app_read, app_write) = tokio::io::split(app_stream);
    let (app_inbound_tx, mut app_inbound) = mpsc::unbounded_channel();
    let (app_sender, app_tasks) = spawn_transport(app_read, app_write, app_inbound_tx);

    let outcome =
        request_shutdown(&app_sender, &mut app_inbound, Duration::from_millis(50)).await;
    assert_eq!(outcome, ShutdownOutcome::TimedOut);
    app_tasks.abort();
}

#[tokio::test]
async fn acks_for_other_requests_are_not_accepted() -> anyhow::Result<()> {
    let (app_stream, daemon_stream) = tokio::io::duplex(4096);
    let (app_read, app_write) = tokio::io::split(app_stream);
    let (app_inbound_tx, mut app_inbound) = mpsc::unbounded_channel();
    let (app_sender, app_tasks) = spawn_transport(app_read, app_write, app_inbound_tx);

    let (daemon_read, daemon_write) = tokio::io::split(daemon_stream);
    let (daemon_inbound_tx, _daemon_inbound) = mpsc::unbounded_channel();
    let (daemon_sender, daemon_tasks) =
        spawn_transport(daemon_read, daemon_write, daemon_inbound_tx);

    let unrelated = Command::new(CommandPayload::Shutdown);
    assert!(daemon_sender.send(&unrelated.reply(CommandPayload::ShutdownAck)));

    let outcome =
        request_shutdown(&app_sender, &mut app_inbound, Duration::from_millis(100)).await;
    assert_eq!(outcome, ShutdownOutcome::TimedOut);
    app_tasks.abort();
    daemon_tasks.abort();
    Ok(())
}
