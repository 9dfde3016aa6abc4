mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use meshcall::registry::PeerEventKind;
use meshcall::signaling::{ClientMessage, RelayMessage, SdpKind, SessionDescription, SignalData};
use meshcall::{
    ConnectionState, Error, LocalIdentity, MediaKind, MeshConfig, MeshState, Role, SessionId,
};
use proptest::prelude::*;
use support::{candidate, participant, signals_to, Harness};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn joining_a_populated_room_waits_for_their_offers() {
    let mut h = Harness::new();
    h.join("me").await;
    assert_eq!(h.mesh.state(), MeshState::Joining);

    h.deliver(RelayMessage::AllUsers(vec![participant("a"), participant("b")]))
        .await;
    assert_eq!(h.mesh.state(), MeshState::Active);

    let snapshot = h.mesh.snapshot();
    assert_eq!(snapshot.local_session.as_ref().map(|s| s.as_str()), Some("me"));
    assert_eq!(snapshot.connections.len(), 2);
    assert!(snapshot.connections.iter().all(|c| c.role == Role::Responder));
    assert!(h.connector.links().iter().all(|l| l.log().offers == 0));
    assert!(h.connector.links().iter().all(|l| l.log().attached == Some(true)));

    // Placeholders until media arrives.
    let tiles = h.mesh.remote_streams().snapshot();
    assert_eq!(tiles.len(), 2);
    assert!(tiles.values().all(|t| t.stream.is_none()));
    assert_eq!(tiles[&SessionId::from("a")].display_name, "A");

    // A candidate that outruns the offer is held until the offer lands.
    h.signal("a", candidate(7)).await;
    assert!(h.connector.link("a").log().candidates.is_empty());
    h.signal("a", SessionDescription::offer("offer-from-a")).await;

    let log = h.connector.link("a").log();
    assert_eq!(log.remote, vec![SdpKind::Offer]);
    assert_eq!(log.answers, 1);
    assert_eq!(log.candidates, vec![candidate(7)]);

    let sent = h.sent();
    assert_eq!(
        signals_to(&sent, "a"),
        vec![SignalData::from(SessionDescription::answer("answer-1"))]
    );
    assert!(signals_to(&sent, "b").is_empty());

    let tiles = h.mesh.remote_streams().snapshot();
    let stream = tiles[&SessionId::from("a")].stream.as_ref().expect("stream for a");
    assert_eq!(stream.id, "stream-a");
    assert!(stream.track(MediaKind::Audio).is_some());
    assert!(stream.track(MediaKind::Video).is_some());
    assert!(tiles[&SessionId::from("b")].stream.is_none());
}

#[tokio::test]
async fn early_candidates_beyond_the_buffer_are_dropped() {
    for (limit, expected) in [(0, vec![]), (1, vec![candidate(2)])] {
        let mut h = Harness::with_config(MeshConfig {
            max_pending_candidates: limit,
            ..support::fast_config()
        });
        h.join("me").await;
        h.deliver(RelayMessage::AllUsers(vec![participant("a")])).await;

        h.signal("a", candidate(1)).await;
        h.signal("a", candidate(2)).await;
        h.signal("a", SessionDescription::offer("offer-from-a")).await;

        let log = h.connector.link("a").log();
        assert_eq!(log.remote, vec![SdpKind::Offer]);
        assert_eq!(log.candidates, expected, "buffer limit {}", limit);
    }
}

#[tokio::test]
async fn empty_room_shows_only_our_preview() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![])).await;

    assert_eq!(h.mesh.state(), MeshState::Active);
    assert!(h.connection_ids().is_empty());
    assert!(h.tile_ids().is_empty());
    let preview = h.mesh.media().subscribe();
    let media = preview.borrow().clone().expect("local preview");
    assert_eq!(media.tracks().len(), 2);
}

#[tokio::test]
async fn late_joiner_gets_our_offer() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![])).await;
    assert!(h.connection_ids().is_empty());

    h.deliver(RelayMessage::UserJoined(participant("c"))).await;
    let snapshot = h.mesh.snapshot();
    assert_eq!(snapshot.connections.len(), 1);
    assert_eq!(snapshot.connections[0].role, Role::Initiator);
    assert_eq!(snapshot.connections[0].state, ConnectionState::Connecting);

    let signals = signals_to(&h.sent(), "c");
    assert_eq!(
        signals,
        vec![
            SignalData::from(candidate(1)),
            SignalData::from(SessionDescription::offer("offer-1")),
        ]
    );

    h.signal("c", SessionDescription::answer("answer-from-c")).await;
    assert_eq!(h.connector.link("c").log().remote, vec![SdpKind::Answer]);
    assert_eq!(
        h.mesh.snapshot().connections[0].state,
        ConnectionState::Connected
    );
    assert!(h.mesh.remote_streams().snapshot()[&SessionId::from("c")].stream.is_some());
}

#[tokio::test]
async fn redelivered_answer_is_not_applied_twice() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![])).await;
    h.deliver(RelayMessage::UserJoined(participant("c"))).await;

    let answer = SessionDescription::answer("answer-from-c");
    h.signal("c", answer.clone()).await;
    h.signal("c", answer).await;
    assert_eq!(h.connector.link("c").log().remote, vec![SdpKind::Answer]);
    assert_eq!(h.connection_ids(), ["c"]);
}

#[tokio::test]
async fn renegotiation_waits_for_the_outstanding_answer() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![])).await;
    h.deliver(RelayMessage::UserJoined(participant("c"))).await;
    let link = h.connector.link("c");

    link.events.emit(PeerEventKind::NegotiationNeeded);
    link.events.emit(PeerEventKind::NegotiationNeeded);
    h.settle().await;
    assert_eq!(link.log().offers, 1);

    h.signal("c", SessionDescription::answer("answer-1")).await;
    assert_eq!(link.log().offers, 2);
}

#[tokio::test]
async fn leave_removes_the_peer_everywhere() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a"), participant("b")]))
        .await;

    h.deliver(RelayMessage::UserLeft {
        session_id: "a".into(),
    })
    .await;
    assert!(h.connector.link("a").log().closed);
    assert_eq!(h.connection_ids(), ["b"]);
    assert_eq!(h.tile_ids(), ["b"]);

    // Duplicate and unknown departures change nothing.
    h.deliver(RelayMessage::UserLeft {
        session_id: "a".into(),
    })
    .await;
    h.deliver(RelayMessage::UserLeft {
        session_id: "zz".into(),
    })
    .await;
    assert_eq!(h.connection_ids(), ["b"]);
    assert!(!h.connector.link("b").log().closed);
    assert_eq!(h.connector.links_for("a").len(), 1);
}

#[tokio::test]
async fn repeated_announcements_keep_one_connection() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a")])).await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a")])).await;
    h.deliver(RelayMessage::UserJoined(participant("a"))).await;

    assert_eq!(h.connector.links_for("a").len(), 1);
    let snapshot = h.mesh.snapshot();
    assert_eq!(snapshot.participants.len(), 1);
    assert_eq!(snapshot.connections[0].role, Role::Responder);
}

#[tokio::test]
async fn our_own_session_is_never_a_peer() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("me"), participant("a")]))
        .await;
    h.deliver(RelayMessage::UserJoined(participant("me"))).await;

    assert_eq!(h.connection_ids(), ["a"]);
    assert_eq!(h.tile_ids(), ["a"]);
    assert!(h.connector.links_for("me").is_empty());
}

#[tokio::test]
async fn signal_for_unknown_peer_is_dropped() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![])).await;

    h.signal("ghost", SessionDescription::offer("v=0")).await;
    assert!(h.connector.links().is_empty());
    assert!(h.sent().is_empty());
    assert_eq!(h.mesh.state(), MeshState::Active);
}

#[tokio::test]
async fn failed_connection_is_dropped_at_once() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a"), participant("b")]))
        .await;

    let link = h.connector.link("a");
    link.events
        .emit(PeerEventKind::StateChanged(ConnectionState::Failed));
    h.settle().await;

    assert!(link.log().closed);
    assert_eq!(h.connection_ids(), ["b"]);
    assert_eq!(h.tile_ids(), ["b"]);
    assert_eq!(h.mesh.snapshot().participants.len(), 1);
}

#[tokio::test]
async fn silent_peer_is_dropped_after_the_stale_timeout() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a"), participant("b")]))
        .await;

    // b drops off the network, a blips and recovers.
    h.connector
        .link("b")
        .events
        .emit(PeerEventKind::StateChanged(ConnectionState::Disconnected));
    let a = h.connector.link("a");
    a.events
        .emit(PeerEventKind::StateChanged(ConnectionState::Disconnected));
    h.settle().await;
    a.events
        .emit(PeerEventKind::StateChanged(ConnectionState::Connected));
    h.settle().await;
    assert_eq!(h.connection_ids(), ["a", "b"]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    h.settle().await;

    assert_eq!(h.connection_ids(), ["a"]);
    assert_eq!(h.tile_ids(), ["a"]);
    assert!(h.connector.link("b").log().closed);
}

#[tokio::test]
async fn stale_timeout_restarts_with_each_disconnect() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a")])).await;
    let a = h.connector.link("a");

    a.events
        .emit(PeerEventKind::StateChanged(ConnectionState::Disconnected));
    h.settle().await;
    a.events
        .emit(PeerEventKind::StateChanged(ConnectionState::Connected));
    h.settle().await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    a.events
        .emit(PeerEventKind::StateChanged(ConnectionState::Disconnected));
    h.settle().await;

    // The first blip's timer fires here but the second outage is younger than the timeout.
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.settle().await;
    assert_eq!(h.connection_ids(), ["a"]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.settle().await;
    assert!(h.connection_ids().is_empty());
    assert!(a.log().closed);
}

#[tokio::test]
async fn negotiation_failure_is_isolated_to_one_peer() {
    let mut h = Harness::new();
    h.connector.reject_remote_from("a");
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a"), participant("b")]))
        .await;

    h.signal("a", SessionDescription::offer("garbage")).await;
    h.signal("b", SessionDescription::offer("offer-from-b")).await;

    assert_eq!(h.connection_ids(), ["b"]);
    assert_eq!(h.tile_ids(), ["b"]);
    assert!(h.connector.link("a").log().closed);
    assert_eq!(h.connector.link("b").log().answers, 1);
    assert_eq!(h.mesh.state(), MeshState::Active);
}

#[tokio::test]
async fn events_from_a_replaced_connection_are_ignored() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![])).await;
    h.deliver(RelayMessage::UserJoined(participant("a"))).await;
    let old = h.connector.link("a");

    h.deliver(RelayMessage::UserLeft {
        session_id: "a".into(),
    })
    .await;
    h.deliver(RelayMessage::UserJoined(participant("a"))).await;
    let current = h.connector.link("a");
    assert!(old.log().closed);
    assert!(!current.log().closed);
    assert_ne!(old.events.epoch(), current.events.epoch());
    h.sent();

    old.events
        .emit(PeerEventKind::StateChanged(ConnectionState::Failed));
    old.events
        .emit(PeerEventKind::LocalDescription(SessionDescription::offer("stale")));
    h.settle().await;

    assert_eq!(h.connection_ids(), ["a"]);
    assert!(h.mesh.remote_streams().snapshot()[&SessionId::from("a")].stream.is_none());
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn disable_tears_everything_down() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a")])).await;
    h.deliver(RelayMessage::UserJoined(participant("b"))).await;
    h.signal("a", SessionDescription::offer("offer-from-a")).await;
    let preview = h.mesh.media().subscribe();
    assert!(preview.borrow().is_some());

    h.mesh.disable().await;

    assert_eq!(h.mesh.state(), MeshState::Idle);
    assert!(h.connector.links().iter().all(|l| l.log().closed));
    assert!(h.mesh.remote_streams().snapshot().is_empty());
    assert!(h.mesh.snapshot().connections.is_empty());
    assert!(preview.borrow().is_none());
    assert_eq!(h.devices.stopped(), 1);
    assert!(h.sent().contains(&ClientMessage::LeaveRoom));

    // Nothing queued before the teardown reaches the next session.
    h.mesh.disable().await;
    assert_eq!(h.devices.stopped(), 1);
    assert!(h.mesh.try_next_input().is_none());
}

#[tokio::test]
async fn rejoining_starts_a_fresh_session() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a")])).await;
    h.mesh.disable().await;

    h.endpoint = h.relay.push();
    h.join("me-again").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a")])).await;

    assert_eq!(h.connector.links_for("a").len(), 2);
    assert_eq!(h.connection_ids(), ["a"]);
    assert_eq!(h.devices.opened(), 2);
    assert_eq!(h.mesh.state(), MeshState::Active);
}

#[tokio::test]
async fn enable_twice_is_rejected() {
    let mut h = Harness::new();
    h.join("me").await;
    let second = h
        .mesh
        .enable("room-2".into(), LocalIdentity::new("me", "Me"))
        .await;
    assert!(matches!(second, Err(Error::InvalidState(_))));
    assert_eq!(h.relay.connects(), 1);
}

#[tokio::test]
async fn denied_permission_never_touches_the_relay() {
    let mut h = Harness::with_devices(support::FakeDevices::denying());
    let result = h
        .mesh
        .enable("room-1".into(), LocalIdentity::new("me", "Me"))
        .await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
    assert_eq!(h.mesh.state(), MeshState::Idle);
    assert_eq!(h.relay.connects(), 0);
}

#[tokio::test]
async fn unreachable_relay_releases_media() {
    let devices = support::FakeDevices::new();
    let connector = support::FakeConnector::new();
    let mut mesh = meshcall::MeshCoordinator::new(
        support::fast_config(),
        support::ScriptedRelay::unreachable(),
        connector,
        devices.clone(),
    );

    let result = mesh
        .enable("room-1".into(), LocalIdentity::new("me", "Me"))
        .await;
    let err = assert_err!(result);
    assert!(matches!(err, Error::ChannelUnavailable(_)));
    assert_eq!(devices.opened(), 1);
    assert_eq!(devices.stopped(), 1);
    assert!(!mesh.media().is_enabled());
    assert_eq!(mesh.state(), MeshState::Idle);
}

#[tokio::test]
async fn losing_the_relay_leaves_the_room() {
    let mut h = Harness::new();
    h.join("me").await;
    h.deliver(RelayMessage::AllUsers(vec![participant("a")])).await;

    let (_, replacement) = meshcall::SignalingChannel::pair(1);
    drop(std::mem::replace(&mut h.endpoint, replacement));
    h.settle().await;

    assert_eq!(h.mesh.state(), MeshState::Idle);
    assert!(h.connector.link("a").log().closed);
    assert!(h.mesh.remote_streams().snapshot().is_empty());
    assert_eq!(h.devices.stopped(), 1);
}

#[tokio::test]
async fn muting_keeps_the_stream() {
    let mut h = Harness::new();
    h.mesh.set_audio_enabled(false);
    h.join("me").await;
    let media = h.mesh.media().current_stream().expect("local media");
    assert!(!media.is_audio_enabled());

    h.mesh.set_audio_enabled(true);
    assert!(media.is_audio_enabled());
    assert!(media.is_live());
}

#[tokio::test]
async fn spawned_coordinator_reports_through_handle() {
    let h = Harness::new();
    let mut endpoint = h.endpoint;
    let (mesh, task) = h.mesh.spawn();
    let mut state = mesh.state();

    assert_ok!(
        mesh.enable("room-1".into(), LocalIdentity::new("me", "Me"))
            .await
    );
    assert!(matches!(
        endpoint.from_client.recv().await,
        Some(ClientMessage::JoinRoom { .. })
    ));
    endpoint
        .to_client
        .send(RelayMessage::AllUsers(vec![participant("a")]))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == MeshState::Active))
        .await
        .expect("active in time")
        .unwrap();
    let mut streams = mesh.remote_streams();
    tokio::time::timeout(Duration::from_secs(5), streams.wait_for(|m| m.len() == 1))
        .await
        .expect("tile in time")
        .unwrap();
    assert_eq!(mesh.snapshot().await.unwrap().connections.len(), 1);

    assert_ok!(mesh.disable().await);
    assert_eq!(*mesh.state().borrow(), MeshState::Idle);
    assert!(mesh.local_media().borrow().is_none());

    drop(mesh);
    task.await.unwrap();
}

#[derive(Debug, Clone)]
enum RoomEvent {
    Join(u8),
    Leave(u8),
    Fail(u8),
}

fn room_event() -> impl Strategy<Value = RoomEvent> {
    prop_oneof![
        3 => (0u8..6).prop_map(RoomEvent::Join),
        2 => (0u8..6).prop_map(RoomEvent::Leave),
        1 => (0u8..6).prop_map(RoomEvent::Fail),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn connections_always_match_the_roster(
        initial in proptest::collection::btree_set(0u8..6, 0..4),
        events in proptest::collection::vec(room_event(), 0..24),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let mut h = Harness::new();
            h.join("me").await;
            let name = |n: u8| format!("p{}", n);

            let mut expected: BTreeSet<String> = initial.iter().map(|n| name(*n)).collect();
            h.deliver(RelayMessage::AllUsers(
                initial.iter().map(|n| participant(&name(*n))).collect(),
            ))
            .await;

            for event in events {
                match event {
                    RoomEvent::Join(n) => {
                        h.deliver(RelayMessage::UserJoined(participant(&name(n)))).await;
                        expected.insert(name(n));
                    }
                    RoomEvent::Leave(n) => {
                        h.deliver(RelayMessage::UserLeft { session_id: name(n).as_str().into() }).await;
                        expected.remove(&name(n));
                    }
                    RoomEvent::Fail(n) => {
                        if expected.contains(&name(n)) {
                            h.connector
                                .link(&name(n))
                                .events
                                .emit(PeerEventKind::StateChanged(ConnectionState::Failed));
                            h.settle().await;
                            expected.remove(&name(n));
                        }
                    }
                }

                let expected: Vec<String> = expected.iter().cloned().collect();
                let snapshot = h.mesh.snapshot();
                let mut roster: Vec<String> = snapshot
                    .participants
                    .iter()
                    .map(|p| p.session_id.to_string())
                    .collect();
                roster.sort();
                assert_eq!(h.connection_ids(), expected);
                assert_eq!(roster, expected);
                assert_eq!(h.tile_ids(), expected);
                let open = h.connector.links().iter().filter(|l| !l.log().closed).count();
                assert_eq!(open, expected.len());
            }
        });
    }
}
