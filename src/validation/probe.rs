//! Connectivity probe
//!
//! Reads each device's canonical property under a hard timeout and classifies
//! the answer. The read runs in its own task: when the timeout fires the task
//! is aborted, so a hung driver never stalls the probe or its siblings.
//!
//! | Read result                       | Outcome | Cached state   |
//! |-----------------------------------|---------|----------------|
//! | value                             | Pass    | Connected      |
//! | no value (null)                   | Fail    | from link check|
//! | timeout / unreachable             | Fail    | Disconnected   |
//! | any other fault                   | Error   | Error          |
//! | panic inside the check            | Error   | Error          |

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::error::{classify, panic_message, ErrorClass, ValidationError};
use crate::error_recovery::{retry_when, RetryPolicy};
use crate::hardware::registry::{ConnectionState, DeviceHandle};
use crate::validation::report::{ProbeOutcome, ProbeResult};

/// Bounded concurrent connectivity checks
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    timeout: Duration,
    concurrency: usize,
    retry: RetryPolicy,
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::from_config(&ProbeConfig::default())
    }
}

impl ConnectivityProbe {
    /// Probe with `timeout` per read, 4 in flight, no retries
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            concurrency: 4,
            retry: RetryPolicy::none(),
        }
    }

    /// Probe configured from the `[probe]` section
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            timeout: config.timeout,
            concurrency: config.concurrency.max(1),
            retry: config.retry.clone(),
        }
    }

    /// Limit the number of probes in flight
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Retry unreachable devices
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-read timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe one device
    ///
    /// Never fails: every condition becomes a [`ProbeResult`]. Only results
    /// whose cached state is `Disconnected` are retried.
    pub async fn check(&self, device: &Arc<DeviceHandle>) -> ProbeResult {
        let result = retry_when(
            &self.retry,
            |attempt| async move {
                let mut result = check_once(device, self.timeout).await;
                result.attempts = attempt;
                result
            },
            |r| r.outcome == ProbeOutcome::Fail && r.state == ConnectionState::Disconnected,
        )
        .await;

        match result.outcome {
            ProbeOutcome::Pass => debug!(device = %result.device_id, "Probe passed"),
            ProbeOutcome::Fail | ProbeOutcome::Error => warn!(
                device = %result.device_id,
                outcome = ?result.outcome,
                message = result.message.as_deref().unwrap_or(""),
                "Probe did not pass"
            ),
        }
        result
    }

    /// Probe every device, at most `concurrency` at a time
    ///
    /// Results come back in input order. A panic inside one device's check
    /// becomes an `Error` result for that device alone.
    pub async fn check_all(&self, devices: &[Arc<DeviceHandle>]) -> Vec<ProbeResult> {
        info!(
            devices = devices.len(),
            concurrency = self.concurrency,
            timeout_ms = self.timeout.as_millis() as u64,
            "Probing devices"
        );
        stream::iter(devices)
            .map(|device| async move {
                let started = Instant::now();
                match AssertUnwindSafe(self.check(device)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => {
                        internal_fault(device, &panic_message(payload.as_ref()), started)
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

/// Result for a device whose check panicked; siblings are unaffected
fn internal_fault(device: &DeviceHandle, message: &str, started: Instant) -> ProbeResult {
    warn!(device = %device.id(), %message, "Internal fault while probing");
    device.set_connection_state(ConnectionState::Error);
    ProbeResult {
        device_id: device.id().to_string(),
        outcome: ProbeOutcome::Error,
        value: None,
        message: Some(format!("probe panicked: {message}")),
        state: ConnectionState::Error,
        elapsed: started.elapsed(),
        attempts: 1,
    }
}

/// Probe one device once with the given timeout
pub async fn check(device: &Arc<DeviceHandle>, timeout: Duration) -> ProbeResult {
    check_once(device, timeout).await
}

async fn check_once(device: &Arc<DeviceHandle>, limit: Duration) -> ProbeResult {
    let started = Instant::now();
    let id = device.id().to_string();
    let readable = device.readable();
    let path = device.read_path().to_string();

    let mut task = tokio::spawn(async move { readable.read(&path).await });
    let waited = timeout(limit, &mut task).await;

    let (outcome, value, message, state) = match waited {
        Err(_) => {
            task.abort();
            let err = ValidationError::timed_out(&id, limit);
            (
                ProbeOutcome::Fail,
                None,
                Some(err.to_string()),
                ConnectionState::Disconnected,
            )
        }
        Ok(Err(join_err)) => (
            ProbeOutcome::Error,
            None,
            Some(format!("read task failed: {join_err}")),
            ConnectionState::Error,
        ),
        Ok(Ok(Ok(Value::Null))) => {
            let remaining = limit.saturating_sub(started.elapsed());
            let connected = timeout(remaining, device.readable().is_connected())
                .await
                .unwrap_or(false);
            let state = if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            (
                ProbeOutcome::Fail,
                None,
                Some(format!("'{}' returned no value", device.read_path())),
                state,
            )
        }
        Ok(Ok(Ok(value))) => (
            ProbeOutcome::Pass,
            Some(value),
            None,
            ConnectionState::Connected,
        ),
        Ok(Ok(Err(e))) => match classify(&e) {
            ErrorClass::Unreachable => (
                ProbeOutcome::Fail,
                None,
                Some(format!("{e:#}")),
                ConnectionState::Disconnected,
            ),
            ErrorClass::Fault => (
                ProbeOutcome::Error,
                None,
                Some(format!("{e:#}")),
                ConnectionState::Error,
            ),
        },
    };

    device.set_connection_state(state);
    ProbeResult {
        device_id: id,
        outcome,
        value,
        message,
        state,
        elapsed: started.elapsed(),
        attempts: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockBehavior, MockMotor, MockSignal};
    use crate::hardware::capabilities::Readable;
    use crate::hardware::registry::{DeviceComponents, DeviceConfig, DeviceRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    fn registry_with(behaviors: &[(&str, MockBehavior)]) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        for (id, behavior) in behaviors {
            let motor = Arc::new(MockMotor::new(&format!("gp:{id}")));
            motor.set_behavior(behavior.clone());
            registry
                .register_components(
                    DeviceConfig::new(*id, &["motors"], format!("gp:{id}.RBV"), "mock_motor"),
                    DeviceComponents {
                        readable: Some(motor.clone()),
                        movable: Some(motor),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_connected_device_passes() {
        let registry = registry_with(&[("m1", MockBehavior::Normal)]);
        let device = registry.get("m1").unwrap();
        let result = check(&device, Duration::from_secs(1)).await;
        assert_eq!(result.outcome, ProbeOutcome::Pass);
        assert_eq!(result.value, Some(json!(0.0)));
        assert_eq!(device.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_classifies_each_failure_mode() {
        let registry = registry_with(&[
            ("down", MockBehavior::Disconnected),
            ("faulty", MockBehavior::Fault("parity error".into())),
            ("silent", MockBehavior::Null),
        ]);

        let down = check(&registry.get("down").unwrap(), Duration::from_secs(1)).await;
        assert_eq!(down.outcome, ProbeOutcome::Fail);
        assert_eq!(down.state, ConnectionState::Disconnected);

        let faulty = check(&registry.get("faulty").unwrap(), Duration::from_secs(1)).await;
        assert_eq!(faulty.outcome, ProbeOutcome::Error);
        assert_eq!(faulty.state, ConnectionState::Error);
        assert!(faulty.message.unwrap().contains("parity error"));

        let silent = check(&registry.get("silent").unwrap(), Duration::from_secs(1)).await;
        assert_eq!(silent.outcome, ProbeOutcome::Fail);
        assert!(silent.message.unwrap().contains("no value"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_device_times_out() {
        let registry = registry_with(&[("hung", MockBehavior::Hang)]);
        let device = registry.get("hung").unwrap();

        let result = check(&device, Duration::from_secs(2)).await;
        assert_eq!(result.outcome, ProbeOutcome::Fail);
        assert_eq!(result.state, ConnectionState::Disconnected);
        assert!(result.message.unwrap().contains("timed out after 2s"));
    }

    #[tokio::test]
    async fn test_check_all_preserves_order() {
        let registry = registry_with(&[
            ("m1", MockBehavior::Normal),
            ("m2", MockBehavior::Disconnected),
            ("m3", MockBehavior::Normal),
        ]);
        let probe = ConnectivityProbe::new(Duration::from_millis(500)).with_concurrency(2);
        let results = probe.check_all(&registry.devices()).await;
        let ids: Vec<_> = results.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        let passed = results
            .iter()
            .filter(|r| r.outcome == ProbeOutcome::Pass)
            .count();
        assert_eq!(passed, 2);
    }

    #[tokio::test]
    async fn test_retry_only_for_unreachable_devices() {
        let registry = registry_with(&[
            ("down", MockBehavior::Disconnected),
            ("faulty", MockBehavior::Fault("bad frame".into())),
        ]);
        let probe = ConnectivityProbe::new(Duration::from_millis(200))
            .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));

        let down = probe.check(&registry.get("down").unwrap()).await;
        assert_eq!(down.attempts, 3);
        let faulty = probe.check(&registry.get("faulty").unwrap()).await;
        assert_eq!(faulty.attempts, 1);
    }

    #[tokio::test]
    async fn test_signal_value_is_reported() {
        let mut registry = DeviceRegistry::new();
        let signal = Arc::new(MockSignal::new("gp:IOC_CPU_LOAD", json!(7.5)));
        registry
            .register_components(
                DeviceConfig::new("cpu", &["baseline"], "gp:IOC_CPU_LOAD", "mock_signal"),
                DeviceComponents {
                    readable: Some(signal),
                    ..Default::default()
                },
            )
            .unwrap();
        let result = check(&registry.get("cpu").unwrap(), Duration::from_secs(1)).await;
        assert_eq!(result.value, Some(json!(7.5)));
    }

    /// Answers without a value, then panics on the link check
    struct GlitchedSignal;

    #[async_trait]
    impl Readable for GlitchedSignal {
        async fn read(&self, _path: &str) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }

        async fn is_connected(&self) -> bool {
            panic!("link check crashed")
        }
    }

    #[tokio::test]
    async fn test_panicking_device_keeps_siblings_in_order() {
        let mut registry = registry_with(&[("m1", MockBehavior::Normal)]);
        registry
            .register_components(
                DeviceConfig::new("bad", &["motors"], "gp:bad.RBV", "glitched"),
                DeviceComponents {
                    readable: Some(Arc::new(GlitchedSignal)),
                    ..Default::default()
                },
            )
            .unwrap();
        let m3 = Arc::new(MockMotor::new("gp:m3"));
        registry
            .register_components(
                DeviceConfig::new("m3", &["motors"], "gp:m3.RBV", "mock_motor"),
                DeviceComponents {
                    readable: Some(m3.clone()),
                    movable: Some(m3),
                    ..Default::default()
                },
            )
            .unwrap();

        let probe = ConnectivityProbe::new(Duration::from_secs(1)).with_concurrency(3);
        let results = probe.check_all(&registry.devices()).await;
        let ids: Vec<_> = results.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "bad", "m3"]);

        assert_eq!(results[0].outcome, ProbeOutcome::Pass);
        assert_eq!(results[1].outcome, ProbeOutcome::Error);
        assert_eq!(results[1].state, ConnectionState::Error);
        assert!(results[1]
            .message
            .as_deref()
            .unwrap()
            .contains("probe panicked: link check crashed"));
        assert_eq!(results[2].outcome, ProbeOutcome::Pass);
        assert_eq!(
            registry.get("bad").unwrap().connection_state(),
            ConnectionState::Error
        );
    }
}
