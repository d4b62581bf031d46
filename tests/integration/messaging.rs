use std::time::Instant;

use csend_services::{NodeEvent, Role, SendError, TransportError};

use crate::*;

/// Two slot nodes that already know each other.
fn pair(net: &VirtualNet, now: Instant) -> (SlotNode, SlotNode) {
    let mut alice = slot_node(net, ALICE, "alice");
    let mut bob = slot_node(net, BOB, "bob");
    run_rounds(&mut [&mut alice, &mut bob], 2, now);
    alice.drain_events();
    bob.drain_events();
    (alice, bob)
}

#[test]
fn test_text_message_reaches_peer() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let (mut alice, mut bob) = pair(&net, now);

    assert_eq!(bob.messaging().role(), Role::Listening);
    alice.send_to_index(1, "hi", now).unwrap();
    bob.tick(now);

    let mut shell = Transcript::default();
    bob.deliver(&mut shell);
    assert_eq!(shell.messages, vec![(ip(ALICE), "alice".to_string(), "hi".to_string())]);
    assert!(shell.peer_lists.is_empty(), "alice was already known");

    // Both slots are idle after the exchange and listen again on the next tick.
    assert_eq!(bob.messaging().role(), Role::Idle);
    bob.tick(now);
    assert_eq!(bob.messaging().role(), Role::Listening);
    alice.tick(now);
    assert_eq!(alice.messaging().role(), Role::Listening);
}

#[test]
fn test_quit_deactivates_sender() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let (mut alice, mut bob) = pair(&net, now);

    let results = alice.shutdown();
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());
    assert!(!net.is_listening(messaging_addr(ALICE)));

    bob.tick(now);
    assert!(bob.peers().get(ip(ALICE)).is_none());
    assert_eq!(bob.drain_events(), vec![NodeEvent::PeerListChanged]);
}

#[test]
fn test_send_refused_while_receiving() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let (mut alice, mut bob) = pair(&net, now);

    // Carol opens a session with bob and keeps it open.
    let carol = net.host(CAROL);
    let mut session = carol.connect(messaging_addr(BOB)).unwrap();
    carol.write(&mut session, b"TEXT|carol@10.0.0.3|first").unwrap();
    bob.tick(now);
    assert_eq!(bob.messaging().role(), Role::Receiving);
    assert_eq!(bob.messaging().peer_address().map(|a| a.ip()), Some(ip(CAROL)));

    assert!(matches!(bob.send_text(ip(ALICE), "busy?", now), Err(SendError::Busy)));

    carol.close(session).unwrap();
    bob.tick(now);
    assert_eq!(bob.messaging().role(), Role::Idle);

    bob.send_text(ip(ALICE), "free now", now).unwrap();
    alice.tick(now);
    let received = texts(&alice.drain_events());
    assert_eq!(received, vec![(ip(BOB), "bob".to_string(), "free now".to_string())]);

    let bob_events = bob.drain_events();
    assert_eq!(texts(&bob_events), vec![(ip(CAROL), "carol".to_string(), "first".to_string())]);
    assert!(bob_events.contains(&NodeEvent::PeerListChanged), "carol is new to bob");
}

#[test]
fn test_sender_field_without_address_is_accepted() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let (_alice, mut bob) = pair(&net, now);

    let carol = net.host(CAROL);
    let mut conn = carol.connect(messaging_addr(BOB)).unwrap();
    carol.write(&mut conn, b"TEXT|carol|hello").unwrap();
    carol.close(conn).unwrap();
    bob.tick(now);

    assert_eq!(
        texts(&bob.drain_events()),
        vec![(ip(CAROL), "carol".to_string(), "hello".to_string())]
    );
    assert_eq!(bob.peers().get(ip(CAROL)).unwrap().display_name, "carol");
}

#[test]
fn test_malformed_frame_is_dropped() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let (_alice, mut bob) = pair(&net, now);

    let carol = net.host(CAROL);
    let mut conn = carol.connect(messaging_addr(BOB)).unwrap();
    carol.write(&mut conn, b"HELLO|carol@10.0.0.3|x").unwrap();
    carol.close(conn).unwrap();
    bob.tick(now);

    assert!(bob.drain_events().is_empty());
    assert!(bob.peers().get(ip(CAROL)).is_none());
    bob.tick(now);
    assert_eq!(bob.messaging().role(), Role::Listening);
}

#[test]
fn test_send_to_absent_peer_is_refused() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let mut alice = slot_node(&net, ALICE, "alice");
    alice.tick(now);

    let err = alice.send_text(ip(CAROL), "anyone?", now).unwrap_err();
    assert!(matches!(err, SendError::Connect(TransportError::Refused)));
    assert!(matches!(alice.send_to_index(1, "x", now), Err(SendError::UnknownPeerIndex(1))));
}

#[test]
fn test_broadcast_text_reaches_every_peer() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let mut alice = slot_node(&net, ALICE, "alice");
    let mut bob = slot_node(&net, BOB, "bob");
    let mut carol = slot_node(&net, CAROL, "carol");
    run_rounds(&mut [&mut alice, &mut bob, &mut carol], 2, now);
    bob.drain_events();
    carol.drain_events();

    let results = alice.broadcast_text("hello all", now);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    bob.tick(now);
    carol.tick(now);
    for node in [&mut bob, &mut carol] {
        assert_eq!(
            texts(&node.drain_events()),
            vec![(ip(ALICE), "alice".to_string(), "hello all".to_string())]
        );
    }
}

#[test]
fn test_quit_from_stranger_raises_nothing() {
    let net = VirtualNet::new();
    let now = Instant::now();
    let (_alice, mut bob) = pair(&net, now);

    let carol = net.host(CAROL);
    let mut conn = carol.connect(messaging_addr(BOB)).unwrap();
    carol.write(&mut conn, b"QUIT|carol@10.0.0.3|").unwrap();
    carol.close(conn).unwrap();
    bob.tick(now);

    assert!(bob.drain_events().is_empty());
    assert!(bob.peers().get(ip(CAROL)).is_none());
    assert_eq!(bob.peers().active_count(), 1);
}
