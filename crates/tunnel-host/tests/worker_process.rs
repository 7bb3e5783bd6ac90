use std::sync::Arc;
use std::time::Duration;
use tunnel_client::{CommunicationMonitor, MonitorConfig, ProcessCommand, ProcessTransport};
use tunnel_core::protocol::{Echo, Ping, Pong, ServiceInfo, ServiceInfoRequest};
use tunnel_core::{
    ChannelStatus, LifecycleState, StartOptions, StatusLog, Transport, TransportError,
};

fn worker(direct: bool) -> Arc<ProcessTransport> {
    let mut command = ProcessCommand::new(env!("CARGO_BIN_EXE_tunnel-worker"));
    if direct {
        command = command.arg("--direct");
    }
    command.env.insert("RUST_LOG".into(), "warn".into());
    Arc::new(ProcessTransport::new(command))
}

fn monitor() -> CommunicationMonitor {
    CommunicationMonitor::new(MonitorConfig {
        request_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    })
}

#[tokio::test]
async fn round_trips_through_the_worker_binary() {
    for direct in [false, true] {
        let transport = worker(direct);
        let log = StatusLog::new();
        transport.subscribe(log.clone());
        transport.start(StartOptions::new()).await.unwrap();

        let monitor = monitor();
        monitor.bind(transport.clone());

        let pong: Pong = monitor.send(&Ping { nonce: 77 }).await.unwrap();
        assert_eq!(pong.nonce, 77);
        let echo: Echo = monitor.send(&Echo { text: "über".into() }).await.unwrap();
        assert_eq!(echo.text, "über");
        let info: ServiceInfo = monitor.send(&ServiceInfoRequest { seq: 1 }).await.unwrap();
        assert_eq!(info.state, LifecycleState::Started);
        assert_eq!(info.messages_handled, 3);

        transport.stop().await;
        assert_eq!(
            log.snapshot(),
            [
                ChannelStatus::Connecting,
                ChannelStatus::Connected,
                ChannelStatus::Disconnecting,
                ChannelStatus::Disconnected,
            ]
        );
    }
}

#[tokio::test]
async fn polling_the_worker_binary() {
    let transport = worker(false);
    transport.start(StartOptions::new()).await.unwrap();

    let monitor = monitor();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut seq = 0;
    monitor.start_monitoring(
        transport.clone(),
        move || {
            let request = ServiceInfoRequest { seq };
            seq += 1;
            request
        },
        move |result| {
            let info: ServiceInfo = result.unwrap();
            let _ = tx.send(info.seq);
        },
        Duration::from_millis(50),
    );

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let seq = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(seq);
    }
    monitor.stop_monitoring();
    transport.stop().await;

    assert_eq!(seen, [0, 1, 2]);
}

#[tokio::test]
async fn failed_worker_start_is_reported_by_start() {
    let config = std::env::temp_dir().join(format!("tunnel-worker-fail-{}.toml", std::process::id()));
    std::fs::write(&config, "[worker]\nfail_start = true\n").unwrap();

    let mut command = ProcessCommand::new(env!("CARGO_BIN_EXE_tunnel-worker"))
        .arg("--config")
        .arg(config.display().to_string());
    command.env.insert("RUST_LOG".into(), "off".into());
    let transport = ProcessTransport::new(command);
    let log = StatusLog::new();
    transport.subscribe(log.clone());

    let result = transport.start(StartOptions::new()).await;
    let _ = std::fs::remove_file(&config);

    let err = result.unwrap_err();
    assert!(matches!(err, TransportError::Lifecycle(_)));
    assert!(err.to_string().contains("configured to fail"));
    assert_eq!(
        log.snapshot(),
        [
            ChannelStatus::Connecting,
            ChannelStatus::Disconnecting,
            ChannelStatus::Disconnected,
        ]
    );
}
