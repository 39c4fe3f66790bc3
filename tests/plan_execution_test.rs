//! Integration tests for plan execution through the shared engine

use daq_validate::config::ValidationConfig;
use daq_validate::experiment::catalog::Catalog;
use daq_validate::experiment::plans::{PlanKind, PlanSpec};
use daq_validate::validation::{PlanOutcome, ValidationContext};
use std::time::Duration;

async fn demo_context() -> ValidationContext {
    ValidationContext::from_config(ValidationConfig::demo().unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_count_creates_first_catalog_record() {
    let ctx = demo_context().await;
    assert_eq!(ctx.catalog.count(), 0);

    let spec = PlanSpec::new(
        "count",
        PlanKind::Count {
            num: 1,
            delay: Duration::ZERO,
        },
    )
    .with_detectors(&["scaler1"])
    .expect_record();
    let result = ctx.runner().execute(&spec).await;

    assert_eq!(result.outcome, PlanOutcome::Pass, "{:?}", result.message);
    assert_eq!(ctx.catalog.count(), 1);
    let latest = ctx.catalog.latest().unwrap();
    assert_eq!(latest.scan_id, 1);
    assert_eq!(result.scan_id, Some(latest.scan_id));
    assert!(latest.data_keys.contains("scaler1"));
}

#[tokio::test]
async fn test_round_trip_is_idempotent() {
    let ctx = demo_context().await;
    let epsilon = 1e-6;

    for delta in [0.1, 1.0, -2.5, 17.25] {
        let spec = PlanSpec::new("round trip", PlanKind::RoundTrip { delta })
            .with_movers(&["m3"])
            .with_return_tolerance(epsilon);
        let result = ctx.runner().execute(&spec).await;

        assert_eq!(result.outcome, PlanOutcome::Pass, "{:?}", result.message);
        let before = result.before.as_ref().unwrap()["m3"];
        let after = result.after.as_ref().unwrap()["m3"];
        assert!(
            (after - before).abs() <= epsilon,
            "delta {delta}: {before} -> {after}"
        );
    }
    // m3 starts at 1.0 in the demo instrument
    let m3 = ctx.registry.get("m3").unwrap().movable().unwrap();
    assert!((m3.position().await.unwrap() - 1.0).abs() <= epsilon);
}

#[tokio::test]
async fn test_scan_ids_increase_across_plans() {
    let ctx = demo_context().await;
    let runner = ctx.runner();

    let scan = PlanSpec::new(
        "relative_scan",
        PlanKind::RelativeScan {
            start: -0.5,
            stop: 0.5,
            points: 3,
        },
    )
    .with_movers(&["m1"])
    .with_detectors(&["adsimdet"])
    .expect_record();

    let first = runner.execute(&scan).await;
    let second = runner.execute(&scan).await;
    assert_eq!(first.scan_id, Some(1));
    assert_eq!(second.scan_id, Some(2));
    assert!(second.data_keys.contains(&"m1".to_string()));
}

#[tokio::test]
async fn test_out_of_limit_move_fails_with_engine_message() {
    let ctx = demo_context().await;
    let spec = PlanSpec::new(
        "too far",
        PlanKind::Scan {
            start: 0.0,
            stop: 500.0,
            points: 2,
        },
    )
    .with_movers(&["m1"])
    .with_detectors(&["scaler1"]);

    let result = ctx.runner().execute(&spec).await;
    assert_eq!(result.outcome, PlanOutcome::Fail);
    assert!(result.message.unwrap().contains("500"));
}

#[tokio::test]
async fn test_custom_plans_in_simulation_leave_motors_alone() {
    let ctx = demo_context().await;
    let runner = ctx.runner();
    let kinds = [
        PlanKind::MotorCharacterization {
            range_fraction: 0.1,
            points: 5,
        },
        PlanKind::QuickScan {
            range: 0.5,
            points: 5,
        },
        PlanKind::DetectorOptimization {
            initial_range: 1.0,
            refinement_cycles: 2,
            points: 5,
        },
        PlanKind::SampleAlignment {
            scan_range: 1.0,
            step_size: 0.2,
        },
    ];

    for kind in kinds {
        let spec = PlanSpec::new(kind.type_name(), kind)
            .with_movers(&["m1", "m2"])
            .with_detectors(&["scaler1"])
            .with_return_tolerance(0.0)
            .simulated();
        let result = runner.execute(&spec).await;
        assert_eq!(result.outcome, PlanOutcome::Pass, "{}: {:?}", result.plan, result.message);
        assert!(result.simulated);
    }
    assert_eq!(ctx.catalog.count(), 0);
}

#[tokio::test]
async fn test_plan_without_required_movers_is_skipped() {
    let ctx = demo_context().await;
    let spec = PlanSpec::new(
        "align",
        PlanKind::SampleAlignment {
            scan_range: 1.0,
            step_size: 0.2,
        },
    )
    .with_movers(&["m1"])
    .with_detectors(&["scaler1"]);

    let result = ctx.runner().execute(&spec).await;
    assert_eq!(result.outcome, PlanOutcome::Skipped);
    assert!(result.message.unwrap().contains("needs 2 mover(s)"));
}
