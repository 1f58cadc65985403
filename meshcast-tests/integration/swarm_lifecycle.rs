//! Peer admission, departure and teardown across engines.

use std::time::Duration;

use meshcast_core::LoaderNotification;
use meshcast_core::swarm::SwarmId;
use meshcast_sim::NetworkConfig;

use crate::support::{Bench, collect_for, peer_first, wait_for};

#[tokio::test]
async fn test_duplicate_candidates_settle_on_one_link() {
    let bench = Bench::new(NetworkConfig {
        duplicate_candidates: true,
    });
    let mut first = bench.node(peer_first(), 1).await;
    bench.load(&first, vec![bench.segment(0, 5)]).await;
    let mut second = bench.node(peer_first(), 2).await;
    bench.load(&second, vec![bench.segment(0, 5)]).await;

    let connected = wait_for(&mut first.notifications, |n| {
        matches!(n, LoaderNotification::PeerConnect { .. })
    })
    .await;
    assert!(matches!(
        connected,
        LoaderNotification::PeerConnect { peer_id, .. } if peer_id == second.peer_id
    ));
    wait_for(&mut second.notifications, |n| {
        matches!(n, LoaderNotification::PeerConnect { .. })
    })
    .await;

    let later = collect_for(&mut first.notifications, Duration::from_millis(200)).await;
    assert!(
        !later
            .iter()
            .any(|n| matches!(n, LoaderNotification::PeerConnect { .. }))
    );
    assert_eq!(first.handle.stats().await.unwrap().connected_peers, 1);
    assert_eq!(second.handle.stats().await.unwrap().connected_peers, 1);
    // The losing pair was closed on both ends
    assert_eq!(bench.network.open_links(), 2);
}

#[tokio::test]
async fn test_destroy_closes_peers_and_leaves_room() {
    let bench = Bench::new(NetworkConfig::default());
    let mut first = bench.node(peer_first(), 1).await;
    bench.load(&first, vec![bench.segment(0, 5)]).await;
    let second = bench.node(peer_first(), 2).await;
    bench.load(&second, vec![bench.segment(0, 5)]).await;
    wait_for(&mut first.notifications, |n| {
        matches!(n, LoaderNotification::PeerConnect { .. })
    })
    .await;

    second.handle.destroy().await.unwrap();

    let closed = wait_for(&mut first.notifications, |n| {
        matches!(n, LoaderNotification::PeerClose { .. })
    })
    .await;
    assert!(matches!(
        closed,
        LoaderNotification::PeerClose { peer_id } if peer_id == second.peer_id
    ));
    let swarm_id = SwarmId::for_stream(&bench.playlist.stream_swarm_id());
    assert_eq!(bench.network.room_size(&swarm_id), 1);
    assert_eq!(first.handle.stats().await.unwrap().connected_peers, 0);
}

#[tokio::test]
async fn test_stream_switch_moves_to_new_room() {
    let bench = Bench::new(NetworkConfig::default());
    let node = bench.node(peer_first(), 1).await;
    let old_room = SwarmId::for_stream(&bench.playlist.stream_swarm_id());
    bench.load(&node, vec![bench.segment(0, 5)]).await;
    assert_eq!(bench.network.room_size(&old_room), 1);

    node.handle
        .load(vec![bench.segment(1, 5)], "stream+audio")
        .await
        .unwrap();

    assert_eq!(bench.network.room_size(&old_room), 0);
    assert_eq!(bench.network.room_size(&SwarmId::for_stream("stream+audio")), 1);
}
