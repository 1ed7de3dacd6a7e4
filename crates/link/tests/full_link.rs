//! End-to-end scenarios against the in-process mock device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use link::{
    LinkConfig, LinkStatus, LinkSupervisor, MockDevice, MockDeviceConfig, MockPortProvider,
    MockSignal,
};
use stim_types::{DeviceFault, LinkEvent, OpCode, Subscribe};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn link_with(config: MockDeviceConfig) -> (MockDevice, Arc<LinkSupervisor>) {
    init_logging();
    let device = MockDevice::spawn(config);
    let provider = MockPortProvider::new(device.host_port());
    let supervisor = LinkSupervisor::new(LinkConfig::fast_test(), Arc::new(provider));
    (device, supervisor)
}

#[derive(Default)]
struct Collector {
    lifecycle: Mutex<Vec<&'static str>>,
    samples: AtomicUsize,
}

impl Subscribe for Collector {
    fn name(&self) -> &'static str {
        "collector"
    }

    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::StreamData(_) => {
                self.samples.fetch_add(1, Ordering::SeqCst);
            }
            other => self.lifecycle.lock().unwrap().push(other.name()),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_brings_the_link_up() {
    let (device, supervisor) = link_with(MockDeviceConfig::default());

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.status(), LinkStatus::Running);
    assert!(supervisor.is_running());
    assert_eq!(device.counters().get(OpCode::Initial), 1);

    supervisor.stop().await;
    assert_eq!(supervisor.status(), LinkStatus::Created);
    assert!(!supervisor.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keepalives_cycle_while_running() {
    let (device, supervisor) = link_with(MockDeviceConfig::default());
    supervisor.start().await.unwrap();

    let counters = device.counters();
    assert!(
        wait_for(
            || counters.get(OpCode::Keepalive) >= 3,
            Duration::from_secs(5)
        )
        .await,
        "keepalives did not cycle"
    );
    assert!(supervisor.is_running(), "link fell over during keepalives");

    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_stream_requests_are_suppressed() {
    let (device, supervisor) = link_with(MockDeviceConfig::default());
    supervisor.start().await.unwrap();

    supervisor.start_streaming().unwrap();
    assert!(
        supervisor.start_streaming().is_err(),
        "second request was not refused"
    );

    assert!(
        wait_for(|| supervisor.is_streaming(), Duration::from_secs(5)).await,
        "stream never started"
    );
    assert_eq!(device.counters().get(OpCode::StartStream), 1);

    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seizure_stream_closes_the_loop() {
    let (device, supervisor) = link_with(MockDeviceConfig {
        signal: MockSignal::Seizure,
        stream_interval: Duration::from_millis(1),
        ..MockDeviceConfig::default()
    });
    let collector = Arc::new(Collector::default());
    supervisor.subscribe(collector.clone());

    supervisor.start().await.unwrap();
    supervisor.start_streaming().unwrap();

    assert!(
        wait_for(|| supervisor.is_stimming(), Duration::from_secs(15)).await,
        "therapy never engaged"
    );
    assert_eq!(device.counters().get(OpCode::StartStim), 1);
    assert!(
        collector.samples.load(Ordering::SeqCst) >= classifier::WINDOW_SIZE,
        "subscribers saw too few samples"
    );
    assert!(
        wait_for(
            || {
                let lifecycle = collector.lifecycle.lock().unwrap();
                lifecycle.contains(&"StreamStarted") && lifecycle.contains(&"TherapyStarted")
            },
            Duration::from_secs(5)
        )
        .await,
        "lifecycle events were not delivered"
    );

    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flat_stream_never_engages_therapy() {
    let (device, supervisor) = link_with(MockDeviceConfig {
        stream_interval: Duration::from_millis(1),
        ..MockDeviceConfig::default()
    });
    supervisor.start().await.unwrap();
    supervisor.start_streaming().unwrap();

    assert!(
        wait_for(|| supervisor.is_streaming(), Duration::from_secs(5)).await,
        "stream never started"
    );
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(!supervisor.is_stimming());
    assert_eq!(device.counters().get(OpCode::StartStim), 0);

    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistent_not_connected_escalates_to_error() {
    // The device echoes the first handshake, then answers every transaction
    // with NotConnected: the sorter retries the handshake, escalates, and
    // the reconnect handshake fails, leaving the link in Error.
    let (_device, supervisor) = link_with(MockDeviceConfig {
        fault: Some(DeviceFault::NotConnected),
        fault_after: 1,
        ..MockDeviceConfig::default()
    });
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.status(), LinkStatus::Running);

    assert!(
        wait_for(
            || supervisor.status() == LinkStatus::Error,
            Duration::from_secs(15)
        )
        .await,
        "link never escalated to Error"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_stream_round_trip_updates_state_and_events() {
    let (device, supervisor) = link_with(MockDeviceConfig {
        stream_interval: Duration::from_millis(2),
        ..MockDeviceConfig::default()
    });
    let collector = Arc::new(Collector::default());
    supervisor.subscribe(collector.clone());
    supervisor.start().await.unwrap();

    supervisor.start_streaming().unwrap();
    assert!(wait_for(|| supervisor.is_streaming(), Duration::from_secs(5)).await);

    supervisor.stop_streaming().unwrap();
    assert!(
        wait_for(|| !supervisor.is_streaming(), Duration::from_secs(5)).await,
        "stream never stopped"
    );
    assert_eq!(device.counters().get(OpCode::StopStream), 1);
    assert!(
        wait_for(
            || collector.lifecycle.lock().unwrap().contains(&"StreamStopped"),
            Duration::from_secs(5)
        )
        .await
    );

    supervisor.stop().await;
}
