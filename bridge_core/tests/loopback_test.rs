// End to end over the loopback agent with real time
use bridge_core::communication::loopback;
use bridge_core::hal::{RecordingDiagnostics, SystemClock};
use bridge_core::{BridgeConfig, NodeRuntime};
use std::thread;
use std::time::{Duration, Instant};

fn fast_config() -> BridgeConfig {
    BridgeConfig::from_toml_str(
        r#"
        [publisher]
        timer_period_ms = 50

        [executor]
        timeout_ms = 20
        "#,
    )
    .unwrap()
}

#[test]
fn test_agent_request_answered() {
    let (session, agent) = loopback(3);
    let mut node = NodeRuntime::new(
        session,
        SystemClock::new(),
        Box::new(RecordingDiagnostics::new()),
        fast_config(),
    );
    node.initialize().unwrap();
    assert_eq!(node.stats().publisher_attempts, 4);

    let caller = thread::spawn(move || {
        let sequence = agent.call("/control", 5).unwrap();
        let response = agent.recv_response(Duration::from_secs(5));
        (sequence, response, agent)
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !caller.is_finished() && Instant::now() < deadline {
        node.spin_some(Duration::from_millis(20)).unwrap();
    }
    let (sequence, response, _agent) = caller.join().unwrap();
    assert_eq!(response, Some((sequence, 4)));
}

#[test]
fn test_agent_sees_publications() {
    let (session, agent) = loopback(0);
    let mut node = NodeRuntime::new(
        session,
        SystemClock::new(),
        Box::new(RecordingDiagnostics::new()),
        fast_config(),
    );
    node.initialize().unwrap();

    let mut payloads = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while payloads.len() < 2 && Instant::now() < deadline {
        node.spin_some(Duration::from_millis(20)).unwrap();
        while let Some(frame) = agent.try_publication() {
            assert_eq!(frame.topic, "chatter");
            payloads.push(frame.text().unwrap_or_default().to_string());
        }
    }
    assert_eq!(payloads[..2], ["0".to_string(), "1".to_string()]);

    let report = node.teardown().unwrap();
    assert!(report.is_clean());
}
