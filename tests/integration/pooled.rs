use std::time::Instant;

use csend_services::{NodeEvent, SlotState};

use crate::*;

#[test]
fn test_pooled_nodes_exchange_text() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let mut alice = pool_node(&net, ALICE, "alice");
    let mut bob = pool_node(&net, BOB, "bob");
    run_rounds(&mut [&mut alice, &mut bob], 2, now);
    bob.drain_events();

    alice.send_text(ip(BOB), "pooled hi", now).unwrap();
    // Sending never touches the listener.
    assert!(alice.messaging().is_listening());

    // Indication, endpoint and accept on the first tick; data on the second.
    bob.tick(now);
    bob.tick(now);
    assert_eq!(
        texts(&bob.drain_events()),
        vec![(ip(ALICE), "alice".to_string(), "pooled hi".to_string())]
    );
    assert!(bob.messaging().slot_states().iter().all(|s| *s == SlotState::Idle));
}

#[test]
fn test_pool_serves_concurrent_sessions() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let mut alice = slot_node(&net, ALICE, "alice");
    let mut bob = pool_node(&net, BOB, "bob");
    alice.tick(now);
    bob.tick(now);

    let carol = net.host(CAROL);
    let dave = net.host("10.0.0.4");
    let mut first = carol.connect(messaging_addr(BOB)).unwrap();
    let mut second = dave.connect(messaging_addr(BOB)).unwrap();
    carol.write(&mut first, b"TEXT|carol@10.0.0.3|one").unwrap();
    dave.write(&mut second, b"TEXT|dave@10.0.0.4|two").unwrap();

    bob.tick(now);
    bob.tick(now);
    let connected = bob
        .messaging()
        .slot_states()
        .into_iter()
        .filter(|s| *s == SlotState::Connected)
        .count();
    assert_eq!(connected, 2);

    let received = texts(&bob.drain_events());
    assert_eq!(received.len(), 2);
    assert!(received.contains(&(ip(CAROL), "carol".to_string(), "one".to_string())));
    assert!(received.contains(&(ip("10.0.0.4"), "dave".to_string(), "two".to_string())));

    // Open inbound sessions do not block outbound sends.
    bob.send_text(ip(ALICE), "still here", now).unwrap();
    alice.tick(now);
    assert_eq!(
        texts(&alice.drain_events()),
        vec![(ip(BOB), "bob".to_string(), "still here".to_string())]
    );

    carol.close(first).unwrap();
    dave.close(second).unwrap();
    bob.tick(now);
    assert!(bob.messaging().slot_states().iter().all(|s| *s == SlotState::Idle));
}

#[test]
fn test_pooled_quit_deactivates_sender() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let mut alice = pool_node(&net, ALICE, "alice");
    let mut bob = pool_node(&net, BOB, "bob");
    run_rounds(&mut [&mut alice, &mut bob], 2, now);
    bob.drain_events();

    let results = alice.shutdown();
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert!(!net.is_listening(messaging_addr(ALICE)));

    bob.tick(now);
    bob.tick(now);
    assert!(bob.peers().get(ip(ALICE)).is_none());
    assert_eq!(bob.drain_events(), vec![NodeEvent::PeerListChanged]);
}
