use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tunnel_client::{CommError, CommunicationMonitor, MonitorConfig};
use tunnel_core::protocol::{Echo, Ping, Pong};
use tunnel_core::{
    ChannelStatus, Frame, Handshake, LifecycleState, StartOptions, StatusLog, Transport, TransportError,
    decode, encode,
};
use tunnel_sim::{
    BoxError, ConfigError, Configuration, Delivery, SimulatedTransport, SimulatorOptions,
    StopReason, Worker,
};

#[derive(Default)]
struct PingWorker {
    fail_start: bool,
    direct_calls: AtomicUsize,
    routed_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for PingWorker {
    async fn configure(&self, configuration: &mut Configuration<'_>) -> Result<(), ConfigError> {
        let calls = self.routed_calls.clone();
        configuration.router().register(move |ping: Ping| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Pong { nonce: ping.nonce }) }
        });
        configuration
            .router()
            .register(|echo: Echo| async move { Ok(echo) });
        Ok(())
    }

    async fn start(&self, _options: &StartOptions) -> Result<(), BoxError> {
        if self.fail_start {
            return Err("tunnel interface unavailable".into());
        }
        Ok(())
    }

    async fn stop(&self, _reason: StopReason) {}

    async fn handle_message(&self, bytes: Vec<u8>) -> Option<Vec<u8>> {
        self.direct_calls.fetch_add(1, Ordering::SeqCst);
        let echo: Echo = decode(&bytes).ok()?;
        encode(&Echo {
            text: echo.text.to_uppercase(),
        })
        .ok()
    }
}

fn simulated(worker: PingWorker, delivery: Delivery) -> (Arc<PingWorker>, SimulatedTransport) {
    let worker = Arc::new(worker);
    let transport = SimulatedTransport::new(
        worker.clone(),
        SimulatorOptions {
            user_config: None,
            delivery,
        },
    );
    (worker, transport)
}

#[tokio::test]
async fn ping_is_answered_through_the_router() {
    let (worker, transport) = simulated(PingWorker::default(), Delivery::Routed);
    transport.start_tunnel(&StartOptions::new()).await.unwrap();

    let monitor = CommunicationMonitor::new(MonitorConfig::default());
    monitor.bind(Arc::new(transport));

    let pong: Pong = monitor.send(&Ping { nonce: 5 }).await.unwrap();
    assert_eq!(pong, Pong { nonce: 5 });
    assert_eq!(worker.routed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(worker.direct_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn direct_delivery_bypasses_the_router() {
    let (worker, transport) = simulated(PingWorker::default(), Delivery::Direct);
    transport.start_tunnel(&StartOptions::new()).await.unwrap();
    assert!(transport.router().is_registered("ping"));

    let monitor = CommunicationMonitor::new(MonitorConfig::default());
    monitor.bind(Arc::new(transport));

    let echo: Echo = monitor.send(&Echo { text: "quiet".into() }).await.unwrap();
    assert_eq!(echo.text, "QUIET");
    assert_eq!(worker.direct_calls.load(Ordering::SeqCst), 1);
    assert_eq!(worker.routed_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unregistered_tag_yields_no_response() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct Shutdown;
    impl tunnel_core::Message for Shutdown {
        const TAG: &'static str = "shutdown";
    }

    let (_, transport) = simulated(PingWorker::default(), Delivery::Routed);
    transport.start_tunnel(&StartOptions::new()).await.unwrap();
    let monitor = CommunicationMonitor::new(MonitorConfig::default());
    monitor.bind(Arc::new(transport));

    let err = monitor.send::<Shutdown, Pong>(&Shutdown).await.unwrap_err();
    assert!(matches!(err, CommError::NilResponse));
}

#[tokio::test]
async fn successful_start_transitions() {
    let (_, transport) = simulated(PingWorker::default(), Delivery::Routed);
    let log = StatusLog::new();
    transport.subscribe(log.clone());
    assert_eq!(transport.status(), ChannelStatus::Invalid);

    Transport::start(&transport, StartOptions::new()).await.unwrap();

    assert_eq!(
        log.snapshot(),
        [ChannelStatus::Connecting, ChannelStatus::Connected]
    );
    assert_eq!(transport.lifecycle_state(), LifecycleState::Started);
}

#[tokio::test]
async fn failed_start_is_reported_to_the_starter_only() {
    let (_, transport) = simulated(
        PingWorker {
            fail_start: true,
            ..Default::default()
        },
        Delivery::Routed,
    );
    let log = StatusLog::new();
    transport.subscribe(log.clone());
    let monitor = CommunicationMonitor::new(MonitorConfig::default());
    transport.attach_monitor(&monitor);

    let err = Transport::start(&transport, StartOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Lifecycle(_)));
    assert!(err.to_string().contains("tunnel interface unavailable"));

    assert_eq!(
        log.snapshot(),
        [
            ChannelStatus::Connecting,
            ChannelStatus::Disconnecting,
            ChannelStatus::Disconnected,
        ]
    );
    assert_eq!(transport.lifecycle_state(), LifecycleState::Stopped);
    // The monitor never got bound.
    assert!(monitor.status().is_none());
}

#[tokio::test]
async fn sends_before_start_never_reach_the_worker() {
    let (worker, transport) = simulated(PingWorker::default(), Delivery::Direct);
    let monitor = CommunicationMonitor::new(MonitorConfig::default());
    monitor.bind(Arc::new(transport.clone()));

    let err = monitor
        .send::<Echo, Echo>(&Echo { text: "early".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CommError::InvalidState(ChannelStatus::Invalid)));

    // Calling the transport directly is refused as well.
    let err = transport.send_message(b"{}".to_vec()).unwrap_err();
    assert!(matches!(
        err,
        TransportError::InvalidState(ChannelStatus::Invalid)
    ));
    assert_eq!(worker.direct_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_binds_the_attached_monitor() {
    let (_, transport) = simulated(PingWorker::default(), Delivery::Routed);
    let monitor = CommunicationMonitor::new(MonitorConfig::default());
    transport.attach_monitor(&monitor);

    assert!(matches!(
        monitor.send::<Ping, Pong>(&Ping { nonce: 1 }).await,
        Err(CommError::InvalidExtension)
    ));

    transport.start_tunnel(&StartOptions::new()).await.unwrap();
    assert_eq!(monitor.status(), Some(ChannelStatus::Connected));
    let pong: Pong = monitor.send(&Ping { nonce: 2 }).await.unwrap();
    assert_eq!(pong.nonce, 2);

    transport.stop_tunnel(StopReason::Requested).await;
    assert!(matches!(
        monitor.send::<Ping, Pong>(&Ping { nonce: 3 }).await,
        Err(CommError::InvalidState(ChannelStatus::Disconnected))
    ));
}

#[tokio::test(start_paused = true)]
async fn polling_a_simulated_worker() {
    let (_, transport) = simulated(PingWorker::default(), Delivery::Routed);
    transport.start_tunnel(&StartOptions::new()).await.unwrap();

    let monitor = CommunicationMonitor::new(MonitorConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut nonce = 0;

    monitor.start_monitoring(
        Arc::new(transport),
        move || {
            let ping = Ping { nonce };
            nonce += 1;
            ping
        },
        move |result: Result<Pong, CommError>| sink.lock().unwrap().push(result.unwrap().nonce),
        Duration::from_secs(1),
    );
    tokio::time::sleep(Duration::from_millis(2500)).await;
    monitor.stop_monitoring();

    assert_eq!(seen.lock().unwrap().clone(), [0, 1, 2]);
}

#[tokio::test]
async fn stdio_host_answers_each_frame() {
    let (host_end, worker_end) = tokio::io::duplex(4096);
    let (worker_read, worker_write) = tokio::io::split(worker_end);
    let (host_read, mut host_write) = tokio::io::split(host_end);

    let worker = Arc::new(PingWorker::default());
    let server = tokio::spawn(tunnel_sim::stdio::serve(
        worker.clone(),
        None,
        Delivery::Routed,
        StartOptions::new(),
        worker_read,
        worker_write,
    ));

    let frames = [
        Frame::new(Some(encode(&Ping { nonce: 11 }).unwrap())).to_line().unwrap(),
        "garbage\n".to_string(),
        Frame::new(Some(encode(&Echo { text: "hi".into() }).unwrap()))
            .to_line()
            .unwrap(),
    ];
    for frame in &frames {
        host_write.write_all(frame.as_bytes()).await.unwrap();
    }

    let mut replies = BufReader::new(host_read).lines();
    let ready = Handshake::from_line(&replies.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(ready, Handshake::Ready);
    let first = Frame::from_line(&replies.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(decode::<Pong>(&first.body.unwrap()).unwrap().nonce, 11);
    let second = Frame::from_line(&replies.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second.body, None);
    let third = Frame::from_line(&replies.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(decode::<Echo>(&third.body.unwrap()).unwrap().text, "hi");

    host_write.shutdown().await.unwrap();
    drop(host_write);
    server.await.unwrap().unwrap();
    assert_eq!(worker.routed_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stdio_host_reports_a_failed_start() {
    let (host_end, worker_end) = tokio::io::duplex(4096);
    let (worker_read, worker_write) = tokio::io::split(worker_end);
    let (host_read, _host_write) = tokio::io::split(host_end);

    let worker = Arc::new(PingWorker {
        fail_start: true,
        ..Default::default()
    });
    let err = tunnel_sim::stdio::serve(
        worker,
        None,
        Delivery::Routed,
        StartOptions::new(),
        worker_read,
        worker_write,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("tunnel interface unavailable"));

    let mut replies = BufReader::new(host_read).lines();
    let line = replies.next_line().await.unwrap().unwrap();
    match Handshake::from_line(&line).unwrap() {
        Handshake::Failed { error } => assert!(error.contains("tunnel interface unavailable")),
        other => panic!("expected a failed handshake, got {other:?}"),
    }
}
