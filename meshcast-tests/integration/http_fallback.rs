//! Origin failures, cooldowns and the initial peer-first phase.

use std::time::Duration;

use meshcast_core::{ErrorKind, LoaderConfig, LoaderNotification};
use meshcast_sim::NetworkConfig;

use crate::support::{Bench, wait_for};

#[tokio::test]
async fn test_failed_origin_request_recovers_after_cooldown() {
    let bench = Bench::new(NetworkConfig::default());
    let mut config = LoaderConfig::for_testing();
    config.http.failed_segment_timeout = Duration::from_millis(100);
    let mut node = bench.node(config, 1).await;
    let url = bench.playlist.url(0);
    bench.origin.fail_url(url.clone());

    bench.load(&node, vec![bench.segment(0, 0)]).await;
    let failed = wait_for(&mut node.notifications, |n| {
        matches!(n, LoaderNotification::SegmentError { .. })
    })
    .await;
    let LoaderNotification::SegmentError { error, peer_id, .. } = failed else {
        unreachable!()
    };
    assert_eq!(error.kind(), ErrorKind::Transport);
    assert_eq!(peer_id, None);

    bench.origin.restore_url(&url);
    tokio::time::sleep(Duration::from_millis(150)).await;
    bench.load(&node, vec![bench.segment(0, 0)]).await;

    wait_for(&mut node.notifications, |n| {
        matches!(n, LoaderNotification::SegmentLoaded { peer_id: None, .. })
    })
    .await;
    assert_eq!(bench.origin.request_count(), 2);
}

#[tokio::test]
async fn test_missing_segment_reports_http_status() {
    let bench = Bench::new(NetworkConfig::default());
    let mut node = bench.node(LoaderConfig::for_testing(), 1).await;

    // Past the end of the playlist, so the origin answers 404
    bench.load(&node, vec![bench.segment(100, 0)]).await;

    let failed = wait_for(&mut node.notifications, |n| {
        matches!(n, LoaderNotification::SegmentError { .. })
    })
    .await;
    assert!(failed.name() == "segment-error");
    assert!(
        node.handle
            .segment(&bench.segment(100, 0).id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_lone_peer_skips_initial_phase() {
    let bench = Bench::new(NetworkConfig::default());
    let mut config = LoaderConfig::for_testing();
    config.http.initial_timeout = Duration::from_secs(30);
    config.http.initial_timeout_per_segment = Duration::from_secs(10);
    let mut node = bench.node(config, 1).await;

    bench.load(&node, vec![bench.segment(0, 0)]).await;

    // The tracker reports a swarm of one, so HTTP starts long before the
    // per-segment timeout
    let started = tokio::time::Instant::now();
    wait_for(&mut node.notifications, |n| {
        matches!(n, LoaderNotification::SegmentLoaded { .. })
    })
    .await;
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_dropped_segment_is_aborted() {
    let bench = Bench::new(NetworkConfig::default());
    let mut node = bench.node(LoaderConfig::for_testing(), 1).await;

    bench
        .load(&node, vec![bench.segment(2, 0), bench.segment(3, 5)])
        .await;
    bench.load(&node, vec![bench.segment(2, 0)]).await;

    let aborted = wait_for(&mut node.notifications, |n| {
        matches!(n, LoaderNotification::SegmentAbort { .. })
    })
    .await;
    assert!(matches!(
        aborted,
        LoaderNotification::SegmentAbort { segment } if segment.id == bench.segment(3, 5).id
    ));
}
