//! Segments travel between engines over the simulated network.

use std::time::Duration;

use meshcast_core::{DownloadMethod, LoaderConfig, LoaderNotification};
use meshcast_sim::NetworkConfig;

use crate::support::{Bench, collect_for, peer_first, wait_for};

#[tokio::test]
async fn test_segment_is_fetched_from_a_peer() {
    let bench = Bench::new(NetworkConfig::default());
    let mut seeder = bench.node(LoaderConfig::for_testing(), 1).await;
    bench.load(&seeder, vec![bench.segment(0, 0)]).await;
    wait_for(&mut seeder.notifications, |n| {
        matches!(n, LoaderNotification::SegmentLoaded { peer_id: None, .. })
    })
    .await;

    let mut leecher = bench.node(peer_first(), 2).await;
    bench.load(&leecher, vec![bench.segment(0, 5)]).await;

    let loaded = wait_for(&mut leecher.notifications, |n| {
        matches!(n, LoaderNotification::SegmentLoaded { .. })
    })
    .await;
    let LoaderNotification::SegmentLoaded { segment, peer_id } = loaded else {
        unreachable!()
    };
    assert_eq!(peer_id, Some(seeder.peer_id));
    assert_eq!(segment.data, Some(bench.playlist.body(0)));

    let uploaded = wait_for(&mut seeder.notifications, |n| {
        matches!(n, LoaderNotification::BytesUploaded { .. })
    })
    .await;
    assert!(matches!(
        uploaded,
        LoaderNotification::BytesUploaded { method: DownloadMethod::P2p, peer_id, .. }
            if peer_id == leecher.peer_id
    ));

    // One origin request in total: the seeder's
    assert_eq!(bench.origin.request_count(), 1);
    let stored = leecher
        .handle
        .segment(&bench.segment(0, 0).id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.data, Some(bench.playlist.body(0)));
}

#[tokio::test]
async fn test_consume_only_peer_never_advertises() {
    let bench = Bench::new(NetworkConfig::default());
    let mut consumer_config = LoaderConfig::for_testing();
    consumer_config.p2p.consume_only = true;
    let mut consumer = bench.node(consumer_config, 1).await;
    bench.load(&consumer, vec![bench.segment(0, 0)]).await;
    wait_for(&mut consumer.notifications, |n| {
        matches!(n, LoaderNotification::SegmentLoaded { .. })
    })
    .await;

    let mut other = bench.node(peer_first(), 2).await;
    bench.load(&other, vec![bench.segment(0, 5)]).await;
    wait_for(&mut other.notifications, |n| {
        matches!(n, LoaderNotification::PeerConnect { .. })
    })
    .await;

    let received = collect_for(&mut other.notifications, Duration::from_millis(300)).await;
    assert!(
        !received
            .iter()
            .any(|n| matches!(n, LoaderNotification::SegmentLoaded { .. }))
    );
    let stats = other.handle.stats().await.unwrap();
    assert_eq!(stats.p2p_downloads, 0);
    assert_eq!(stats.connected_peers, 1);
}

#[tokio::test]
async fn test_consume_only_peer_still_downloads() {
    let bench = Bench::new(NetworkConfig::default());
    let mut seeder = bench.node(LoaderConfig::for_testing(), 1).await;
    bench.load(&seeder, vec![bench.segment(1, 0)]).await;
    wait_for(&mut seeder.notifications, |n| {
        matches!(n, LoaderNotification::SegmentLoaded { .. })
    })
    .await;

    let mut consumer_config = peer_first();
    consumer_config.p2p.consume_only = true;
    let mut consumer = bench.node(consumer_config, 2).await;
    bench.load(&consumer, vec![bench.segment(1, 5)]).await;

    let loaded = wait_for(&mut consumer.notifications, |n| {
        matches!(n, LoaderNotification::SegmentLoaded { .. })
    })
    .await;
    assert!(matches!(
        loaded,
        LoaderNotification::SegmentLoaded { peer_id: Some(peer_id), .. } if peer_id == seeder.peer_id
    ));
}
