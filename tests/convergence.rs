//! End-to-end convergence tests over in-memory duplex pipes.
//!
//! Routers are wired the way the simulator wires them: a duplex pipe per
//! link, remote keys supplied out-of-band, keepalives off. Timers are
//! shrunk so trees settle and snakes close within a few seconds of real
//! time; every assertion polls with a deadline rather than sleeping a
//! fixed amount.

use std::future::Future;
use std::time::Duration;

use pinecone::{
    ConnectOptions, Coordinates, Frame, Identity, Port, PublicKey, Router, RouterConfig,
    RouterError,
};

fn fast_config() -> RouterConfig {
    RouterConfig {
        announcement_interval: Duration::from_secs(1),
        announcement_timeout: Duration::from_secs(4),
        parent_timeout: Duration::from_secs(5),
        path_timeout: Duration::from_secs(60),
        bootstrap_interval: Duration::from_millis(300),
        maintenance_interval: Duration::from_millis(100),
        ping_timeout: Duration::from_secs(2),
        delivered_capacity: 128,
    }
}

fn make_router() -> Router {
    Router::builder(Identity::generate())
        .config(fast_config())
        .build()
}

/// Routers sorted ascending by public key.
fn sorted_routers(n: usize) -> Vec<Router> {
    let mut identities: Vec<Identity> = (0..n).map(|_| Identity::generate()).collect();
    identities.sort_by_key(|id| id.public_key);
    identities
        .into_iter()
        .map(|id| Router::builder(id).config(fast_config()).build())
        .collect()
}

/// Wire two routers together as the simulator does: one pipe, keys known
/// out-of-band, no keepalives. Returns (port on a, port on b).
async fn link(a: &Router, b: &Router) -> (Port, Port) {
    let (stream_a, stream_b) = tokio::io::duplex(65536);
    let options_a = ConnectOptions::new()
        .expected_key(b.public_key())
        .keepalives(false);
    let options_b = ConnectOptions::new()
        .expected_key(a.public_key())
        .keepalives(false);
    let port_a = a.connect(stream_a, options_a).await.expect("connect a->b");
    let port_b = b.connect(stream_b, options_b).await.expect("connect b->a");
    (port_a, port_b)
}

/// Poll an async condition until it holds or the deadline passes.
async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn two_node_tree() {
    let routers = sorted_routers(2);
    let (a, b) = (&routers[0], &routers[1]);
    let (_port_ab, port_ba) = link(a, b).await;

    // The greater key becomes the root; the lesser adopts it as parent.
    eventually("two-node tree convergence", || async {
        b.is_root().await
            && !a.is_root().await
            && a.parent_public_key().await == b.public_key()
    })
    .await;

    assert!(b.coords().await.is_empty());
    // Our coordinates are the egress port the parent used to reach us.
    assert_eq!(a.coords().await, Coordinates::new(vec![port_ba]));
    assert_eq!(a.root_public_key().await, b.public_key());

    let peers = a.peers().await;
    assert_eq!(peers.len(), 1);
    assert!(peers[0].alive);
    assert_eq!(peers[0].public_key, Some(b.public_key()));
}

#[tokio::test]
async fn three_node_path_routes_and_partitions() {
    let a = make_router();
    let b = make_router();
    let c = make_router();
    link(&a, &b).await;
    link(&b, &c).await;

    // Everyone settles under one root with consistent coordinates.
    eventually("line convergence", || async {
        let roots = [
            a.root_public_key().await,
            b.root_public_key().await,
            c.root_public_key().await,
        ];
        roots[0] == roots[1] && roots[1] == roots[2]
    })
    .await;

    // A tree-routed frame from a reaches c.
    let c_coords = c.coords().await;
    let frame = Frame::TreeRouted {
        destination: c_coords.clone(),
        source: a.coords().await,
        payload: b"across the line".to_vec(),
    };
    a.send(frame).await.unwrap();
    let mut c = c;
    let delivered = tokio::time::timeout(Duration::from_secs(5), c.recv())
        .await
        .expect("tree frame was not delivered")
        .unwrap();
    match delivered {
        Frame::TreeRouted { payload, .. } => assert_eq!(payload, b"across the line"),
        other => panic!("unexpected delivery: {:?}", other.frame_type()),
    }

    // Pings round-trip both over the tree and over keyspace. The keyspace
    // ping may need the snake to finish closing, so it retries.
    a.tree_ping(c_coords.clone()).await.expect("tree ping");
    eventually("snek ping succeeds", || async {
        a.snek_ping(c.public_key()).await.is_ok()
    })
    .await;

    // Kill the middle node: the ends partition and re-elect themselves.
    b.shutdown().await;
    eventually("partition recovery", || async {
        a.is_root().await && c.is_root().await
    })
    .await;

    // No route remains to anything beyond ourselves.
    let unreachable = Coordinates::new(vec![9, 9]);
    let err = a.tree_ping(unreachable).await.unwrap_err();
    assert!(matches!(err, RouterError::PingTimeout));

    // No snake state survives pointing at the dead link.
    eventually("snake state drained", || async {
        let info = a.dht_info().await;
        info.table.is_empty() && info.ascending.is_none() && info.descending.is_none()
    })
    .await;
}

#[tokio::test]
async fn five_node_mesh_forms_snake_ring() {
    let n = 5;
    let routers = sorted_routers(n);
    for i in 0..n {
        for j in (i + 1)..n {
            link(&routers[i], &routers[j]).await;
        }
    }
    let keys: Vec<PublicKey> = routers.iter().map(|r| r.public_key()).collect();

    // The greatest key roots the tree for everyone.
    eventually("mesh tree convergence", || async {
        for router in &routers {
            if router.root_public_key().await != keys[n - 1] {
                return false;
            }
        }
        true
    })
    .await;

    // The snake closes into a ring: ascending is the next-higher key
    // cyclically, descending the next-lower.
    eventually("snake ring closure", || async {
        for (i, router) in routers.iter().enumerate() {
            let info = router.dht_info().await;
            let expected_up = keys[(i + 1) % n];
            let expected_down = keys[(i + n - 1) % n];
            match (&info.ascending, &info.descending) {
                (Some(up), Some(down))
                    if up.public_key == expected_up && down.public_key == expected_down => {}
                _ => return false,
            }
        }
        true
    })
    .await;

    // Keyspace traffic from the lowest key reaches the highest.
    let frame = Frame::SnekRouted {
        destination_key: keys[n - 1],
        source_key: keys[0],
        watermark: Default::default(),
        payload: b"snakes all the way up".to_vec(),
    };
    routers[0].send(frame).await.unwrap();
    let mut routers = routers;
    let delivered = tokio::time::timeout(Duration::from_secs(5), routers[n - 1].recv())
        .await
        .expect("snek frame was not delivered")
        .unwrap();
    match delivered {
        Frame::SnekRouted {
            source_key,
            payload,
            ..
        } => {
            assert_eq!(source_key, keys[0]);
            assert_eq!(payload, b"snakes all the way up");
        }
        other => panic!("unexpected delivery: {:?}", other.frame_type()),
    }

    // Paths never reference the local port and agree with the common root.
    for router in &routers {
        let info = router.dht_info().await;
        for path in &info.table {
            assert!(
                path.source_port != path.destination_port,
                "degenerate path entry"
            );
            assert_eq!(path.root_public_key, keys[n - 1]);
        }
    }
}

#[tokio::test]
async fn snek_ping_round_trips_across_keyspace() {
    let routers = sorted_routers(3);
    link(&routers[0], &routers[1]).await;
    link(&routers[1], &routers[2]).await;

    eventually("tree settles under the highest key", || async {
        for router in &routers {
            if router.root_public_key().await != routers[2].public_key() {
                return false;
            }
        }
        true
    })
    .await;

    // Lowest pings highest by key, crossing the middle node.
    eventually("snek ping succeeds", || async {
        routers[0].snek_ping(routers[2].public_key()).await.is_ok()
    })
    .await;

    // And the other way down the keyspace once the ring has closed.
    eventually("reverse snek ping succeeds", || async {
        routers[2].snek_ping(routers[0].public_key()).await.is_ok()
    })
    .await;
}
