//! Whole-stream playback with several viewers.

use std::time::Duration;

use meshcast_core::LoaderConfig;
use meshcast_sim::{OriginConfig, ScenarioConfig, run_scenario};

use crate::support::init_test_tracing;

#[tokio::test]
async fn test_staggered_viewers_offload_the_origin() {
    init_test_tracing();
    let scenario = ScenarioConfig {
        viewers: 3,
        segments: 12,
        segment_size: 2048,
        window: 8,
        segment_duration: Duration::from_millis(100),
        stagger: Duration::from_millis(400),
        origin: OriginConfig {
            latency: Duration::from_millis(5),
            ..OriginConfig::default()
        },
        ..ScenarioConfig::default()
    };

    let reports = tokio::time::timeout(
        Duration::from_secs(30),
        run_scenario(&scenario, &LoaderConfig::for_testing()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(reports.len(), 3);
    for report in &reports {
        assert_eq!(report.segments_played, 12);
        assert_eq!(report.stalls, 0);
        assert_eq!(report.http_bytes + report.p2p_bytes, 12 * 2048);
    }
    let p2p: u64 = reports.iter().map(|report| report.p2p_bytes).sum();
    assert!(p2p > 0);
    assert!(reports.iter().any(|report| report.uploaded_bytes > 0));
}

#[tokio::test]
async fn test_disabled_p2p_uses_origin_only() {
    init_test_tracing();
    let scenario = ScenarioConfig {
        viewers: 2,
        segments: 4,
        segment_size: 1024,
        window: 3,
        segment_duration: Duration::from_millis(20),
        stagger: Duration::from_millis(50),
        ..ScenarioConfig::default()
    };
    let mut loader = LoaderConfig::for_testing();
    loader.p2p.enabled = false;

    let reports = run_scenario(&scenario, &loader).await.unwrap();

    for report in &reports {
        assert_eq!(report.p2p_bytes, 0);
        assert_eq!(report.peers_connected, 0);
        assert_eq!(report.http_bytes, 4 * 1024);
    }
}
