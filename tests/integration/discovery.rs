use std::time::{Duration, Instant};

use csend_core::wire::PEER_TIMEOUT_SECS;
use csend_services::{NodeEvent, NodeOptions};

use crate::*;

#[test]
fn test_two_nodes_discover_each_other() {
    let net = VirtualNet::new();
    let mut alice = slot_node(&net, ALICE, "alice");
    let mut bob = slot_node(&net, BOB, "bob");
    let now = Instant::now();

    run_rounds(&mut [&mut alice, &mut bob], 2, now);

    let seen_by_alice = alice.peers().list_active();
    assert_eq!(seen_by_alice.len(), 1);
    assert_eq!(seen_by_alice[0].address, ip(BOB));
    assert_eq!(seen_by_alice[0].display_name, "bob");

    let seen_by_bob = bob.peers().list_active();
    assert_eq!(seen_by_bob.len(), 1);
    assert_eq!(seen_by_bob[0].address, ip(ALICE));
    assert_eq!(seen_by_bob[0].display_name, "alice");

    let mut shell = Transcript::default();
    alice.deliver(&mut shell);
    assert_eq!(shell.peer_lists.len(), 1, "one coalesced peer-list change");
    assert_eq!(shell.peer_lists[0].len(), 1);
}

#[test]
fn test_own_broadcast_is_ignored() {
    let net = VirtualNet::new();
    let mut alice = slot_node(&net, ALICE, "alice");
    let now = Instant::now();

    alice.tick(now);
    alice.tick(now + Duration::from_secs(11));

    assert_eq!(alice.peers().active_count(), 0);
    assert!(alice.drain_events().is_empty());
}

#[test]
fn test_rediscovery_refreshes_without_event() {
    let net = VirtualNet::new();
    let mut alice = slot_node(&net, ALICE, "alice");
    let mut bob = slot_node(&net, BOB, "bob");
    let start = Instant::now();

    run_rounds(&mut [&mut alice, &mut bob], 2, start);
    alice.drain_events();

    let later = start + Duration::from_secs(20);
    run_rounds(&mut [&mut alice, &mut bob], 2, later);

    assert!(alice.drain_events().is_empty());
    assert_eq!(alice.peers().get(ip(BOB)).unwrap().last_seen, later);
}

#[test]
fn test_full_table_drops_new_peers() {
    let net = VirtualNet::new();
    let options = NodeOptions {
        peer_capacity: 2,
        ..NodeOptions::default()
    };
    let mut alice = slot_node_with(&net, ALICE, "alice", options);
    let mut bob = slot_node(&net, BOB, "bob");
    let mut carol = slot_node(&net, CAROL, "carol");
    let mut dave = slot_node(&net, "10.0.0.4", "dave");
    let now = Instant::now();

    run_rounds(&mut [&mut bob, &mut carol, &mut dave, &mut alice], 2, now);

    assert_eq!(alice.peers().active_count(), 2);
    assert_eq!(bob.peers().active_count(), 3);
}

#[test]
fn test_silent_peer_expires_and_returns() {
    let net = VirtualNet::new();
    let mut alice = slot_node(&net, ALICE, "alice");
    let mut bob = slot_node(&net, BOB, "bob");
    let start = Instant::now();

    run_rounds(&mut [&mut alice, &mut bob], 2, start);
    alice.drain_events();

    // Bob goes quiet past the timeout.
    let later = start + Duration::from_secs(PEER_TIMEOUT_SECS + 1);
    alice.tick(later);
    assert!(alice.peers().get(ip(BOB)).is_none());
    assert_eq!(alice.drain_events(), vec![NodeEvent::PeerListChanged]);

    // Bob wakes up, hears alice's broadcast and answers.
    bob.tick(later);
    alice.tick(later);
    let record = alice.peers().get(ip(BOB)).expect("bob rediscovered");
    assert!(record.active);
    assert_eq!(record.last_seen, later);
    assert_eq!(alice.drain_events(), vec![NodeEvent::PeerListChanged]);
}
