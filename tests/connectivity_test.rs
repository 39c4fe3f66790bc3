//! Integration tests for connectivity probing
//!
//! These tests use real time: the probe must come back at the timeout, not
//! earlier and not indefinitely later, whatever the device does.

use daq_validate::config::ValidationConfig;
use daq_validate::hardware::registry::{ConnectionState, DeviceRegistry};
use daq_validate::validation::probe::{self, ConnectivityProbe};
use daq_validate::validation::{
    ProbeOutcome, Suite, ValidationContext, ValidationOrchestrator,
};
use std::time::{Duration, Instant};

const THREE_MOTORS: &str = r#"
labels = ["motors", "detectors"]

[[devices]]
id = "m1"
labels = ["motors"]
read_path = "gp:m1.RBV"
driver = "mock_motor"

[[devices]]
id = "m2"
labels = ["motors"]
read_path = "gp:m2.RBV"
driver = "mock_motor"

[devices.settings]
behavior = "disconnected"

[[devices]]
id = "m3"
labels = ["motors"]
read_path = "gp:m3.RBV"
driver = "mock_motor"
"#;

#[tokio::test]
async fn test_never_responding_device_returns_at_timeout() {
    let config: ValidationConfig = toml::from_str(
        r#"
        labels = ["detectors"]

        [[devices]]
        id = "stuck"
        labels = ["detectors"]
        read_path = "gp:IOC_STUCK"
        driver = "mock_signal"

        [devices.settings]
        behavior = "hang"
        "#,
    )
    .unwrap();
    let registry = DeviceRegistry::from_config(&config.labels, &config.devices)
        .await
        .unwrap();
    let device = registry.get("stuck").unwrap();

    let start = Instant::now();
    let result = probe::check(&device, Duration::from_secs(2)).await;
    let elapsed = start.elapsed();

    println!("Hung probe returned after {:?}", elapsed);
    assert_ne!(result.outcome, ProbeOutcome::Pass);
    assert!(
        elapsed >= Duration::from_millis(1950) && elapsed <= Duration::from_millis(2500),
        "Expected ~2000ms, got {}ms",
        elapsed.as_millis()
    );
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_hung_device_does_not_stall_siblings() {
    let config: ValidationConfig = toml::from_str(
        r#"
        labels = ["motors"]

        [[devices]]
        id = "m1"
        labels = ["motors"]
        read_path = "gp:m1.RBV"
        driver = "mock_motor"

        [devices.settings]
        behavior = "hang"

        [[devices]]
        id = "m2"
        labels = ["motors"]
        read_path = "gp:m2.RBV"
        driver = "mock_motor"
        "#,
    )
    .unwrap();
    let registry = DeviceRegistry::from_config(&config.labels, &config.devices)
        .await
        .unwrap();

    let start = Instant::now();
    let results = ConnectivityProbe::new(Duration::from_millis(500))
        .check_all(&registry.discover("motors").unwrap())
        .await;

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(results[0].outcome, ProbeOutcome::Fail);
    assert_eq!(results[1].outcome, ProbeOutcome::Pass);
}

#[tokio::test]
async fn test_two_of_three_motors_reachable() {
    let config: ValidationConfig = toml::from_str(THREE_MOTORS).unwrap();
    let ctx = ValidationContext::from_config(config).await.unwrap();
    let orchestrator = ValidationOrchestrator::new(ctx);

    let report = orchestrator.run(&[Suite::Connectivity]).await.unwrap();
    let connectivity = report.suite("connectivity").unwrap();

    assert_eq!(connectivity.passed_count(), 2);
    assert_eq!(connectivity.total_count(), 3);
    assert!(!report.overall_passed);

    let failed: Vec<_> = connectivity
        .results()
        .iter()
        .filter(|r| !r.is_pass())
        .map(|r| r.subject().to_string())
        .collect();
    assert_eq!(failed, vec!["m2"]);
    assert!(report.to_string().contains("connectivity: 2/3 passed"));
}

#[tokio::test]
async fn test_probe_results_follow_discovery_order() {
    let config: ValidationConfig = toml::from_str(THREE_MOTORS).unwrap();
    let registry = DeviceRegistry::from_config(&config.labels, &config.devices)
        .await
        .unwrap();

    let results = ConnectivityProbe::new(Duration::from_secs(1))
        .with_concurrency(3)
        .check_all(&registry.discover("motors").unwrap())
        .await;
    let ids: Vec<_> = results.iter().map(|r| r.device_id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}
