//! Loopback tests: one server endpoint, one or more peers, real sockets.

use lettuce::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    seq: u32,
    text: String,
}

impl Message for Chat {
    const TYPE_ID: u32 = 1000;
}

fn chat(seq: u32) -> Chat {
    Chat {
        seq,
        text: format!("message {seq}"),
    }
}

fn codec() -> Arc<MessageRegistry> {
    let mut builder = lettuce::messages::registry_builder().unwrap();
    builder
        .module("test.chat", 1000..=1099)
        .unwrap()
        .register::<Chat>()
        .unwrap();
    Arc::new(builder.build())
}

fn options() -> EndpointOptions {
    EndpointOptions::default().with_dequeue_timeout(Duration::from_millis(50))
}

fn server_with(options: EndpointOptions) -> ServerEndpoint {
    lettuce::dev_tracing::init_tracing();
    ServerEndpoint::bind(Endpoint::parse("tcp://127.0.0.1:0").unwrap(), options, codec()).unwrap()
}

fn server() -> ServerEndpoint {
    server_with(options())
}

fn peer(name: &str, server: &ServerEndpoint) -> PeerEndpoint {
    PeerEndpoint::connect(name, server.local_addr().into(), options(), codec()).unwrap()
}

/// Forward every `M` published on `hub` into a channel.
fn collect<M: Message + Clone>(hub: &BroadcastHub) -> flume::Receiver<M> {
    let (tx, rx) = flume::unbounded();
    hub.subscribe::<M, _>(move |m: &M| {
        let _ = tx.send(m.clone());
    });
    rx
}

/// Register `peer` and wait for the ack.
fn register(peer: &PeerEndpoint, publish_to_server: bool) {
    let acks = collect::<RegisterClientAck>(peer.hub());
    peer.register_with_server(publish_to_server, true).unwrap();
    acks.recv_timeout(WAIT).expect("no RegisterClientAck");
}

/// Wait for the first event matching `pred`, skipping others.
fn wait_for(monitor: &EndpointMonitor, pred: impl Fn(&EndpointEvent) -> bool) -> EndpointEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = monitor.recv_timeout(left).expect("event did not arrive");
        if pred(&event) {
            return event;
        }
    }
}

fn failure(event: &EndpointEvent) -> Option<&LettuceError> {
    match event {
        EndpointEvent::Failure(err) => Some(err),
        _ => None,
    }
}

#[test]
fn register_then_exchange_messages() {
    let server = server();
    let events = server.monitor();
    let on_server = collect::<Chat>(server.hub());

    let client = peer("c1", &server);
    let on_client = collect::<Chat>(client.hub());
    register(&client, true);

    assert!(matches!(
        wait_for(&events, |e| matches!(e, EndpointEvent::ClientRegistered(_))),
        EndpointEvent::ClientRegistered(ref id) if id == "c1"
    ));
    assert!(server.is_registered("c1"));
    assert_eq!(server.registered_clients(), vec!["c1"]);

    let in_mailbox = collect::<Chat>(&server.client_mailbox("c1").unwrap());
    client.send_message(chat(1)).unwrap();
    assert_eq!(in_mailbox.recv_timeout(WAIT).unwrap(), chat(1));
    assert_eq!(on_server.recv_timeout(WAIT).unwrap(), chat(1));

    server.send_to("c1", chat(2)).unwrap();
    assert_eq!(on_client.recv_timeout(WAIT).unwrap(), chat(2));
}

#[test]
fn messages_arrive_in_enqueue_order() {
    let server = server();
    let client = peer("ordered", &server);
    register(&client, false);
    let mailbox = collect::<Chat>(&server.client_mailbox("ordered").unwrap());
    let on_client = collect::<Chat>(client.hub());

    for seq in 0..100 {
        client.send_message(chat(seq)).unwrap();
        server.send_to("ordered", chat(seq)).unwrap();
    }
    for seq in 0..100 {
        assert_eq!(mailbox.recv_timeout(WAIT).unwrap().seq, seq);
        assert_eq!(on_client.recv_timeout(WAIT).unwrap().seq, seq);
    }
}

#[test]
fn mailbox_only_unless_publishing_to_server() {
    let server = server();
    let on_server = collect::<Chat>(server.hub());
    let client = peer("quiet", &server);
    register(&client, false);
    let mailbox = collect::<Chat>(&server.client_mailbox("quiet").unwrap());

    client.send_message(chat(7)).unwrap();
    assert_eq!(mailbox.recv_timeout(WAIT).unwrap(), chat(7));
    assert!(on_server.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn duplicate_registration_is_reported_and_session_kept() {
    let server = server();
    let events = server.monitor();
    let client = peer("dup", &server);
    register(&client, false);
    let first = server.client_session("dup").unwrap();

    client.register_with_server(true, true).unwrap();
    let event = wait_for(&events, |e| failure(e).is_some());
    assert!(matches!(
        failure(&event),
        Some(LettuceError::DuplicateRegistration(id)) if id == "dup"
    ));

    let kept = server.client_session("dup").unwrap();
    assert!(Arc::ptr_eq(&first, &kept));
    assert!(!kept.publishes_to_server());
}

#[test]
fn reregistration_after_deregistration_gets_a_fresh_session() {
    let server = server();
    let events = server.monitor();
    let client = peer("again", &server);
    register(&client, false);
    let old = server.client_session("again").unwrap();
    let old_mailbox = collect::<Chat>(old.mailbox());

    let deregistered = collect::<DeRegisterClientAck>(client.hub());
    client.deregister_from_server().unwrap();
    deregistered.recv_timeout(WAIT).expect("no DeRegisterClientAck");
    wait_for(&events, |e| matches!(e, EndpointEvent::ClientDeregistered(_)));
    assert!(!old.is_registered());
    assert!(!server.is_registered("again"));

    register(&client, false);
    let fresh = server.client_session("again").unwrap();
    assert!(!Arc::ptr_eq(&old, &fresh));
    assert_eq!(fresh.mailbox().subscriber_count(Chat::TYPE_ID), 0);

    let new_mailbox = collect::<Chat>(fresh.mailbox());
    client.send_message(chat(3)).unwrap();
    assert_eq!(new_mailbox.recv_timeout(WAIT).unwrap(), chat(3));
    assert!(old_mailbox.try_recv().is_err());
}

#[test]
fn broadcast_reaches_the_session_snapshot() {
    let server = server();
    let events = server.monitor();
    let a = peer("a", &server);
    let b = peer("b", &server);
    register(&a, false);
    register(&b, false);
    server.pre_register_client("not-yet", false).unwrap();

    let on_a = collect::<Chat>(a.hub());
    let on_b = collect::<Chat>(b.hub());
    assert_eq!(server.broadcast(chat(9)).unwrap(), 3);
    assert_eq!(on_a.recv_timeout(WAIT).unwrap(), chat(9));
    assert_eq!(on_b.recv_timeout(WAIT).unwrap(), chat(9));

    // Pre-registered but never connected: its copy fails, the rest went out.
    let event = wait_for(&events, |e| failure(e).is_some());
    assert!(matches!(
        failure(&event),
        Some(LettuceError::UnknownRecipient(id)) if id == "not-yet"
    ));
    assert_eq!(server.state(), LoopState::Running);

    // Joins after the snapshot: nothing for it.
    let late = peer("late", &server);
    let on_late = collect::<Chat>(late.hub());
    register(&late, false);
    assert!(on_late.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn sending_to_an_unknown_identity_is_reported_not_fatal() {
    let server = server();
    let events = server.monitor();
    server.send_to("ghost", chat(1)).unwrap();

    let event = wait_for(&events, |e| failure(e).is_some());
    assert!(matches!(
        failure(&event),
        Some(LettuceError::UnknownRecipient(id)) if id == "ghost"
    ));
    assert_eq!(server.state(), LoopState::Running);

    let client = peer("alive", &server);
    register(&client, false);
}

#[test]
fn strict_policy_stops_on_unknown_recipient() {
    let server = server_with(options().strict());
    let events = server.monitor();
    server.send_to("ghost", chat(1)).unwrap();

    let event = wait_for(&events, |e| failure(e).is_some());
    assert!(matches!(failure(&event), Some(LettuceError::UnknownRecipient(_))));
    wait_for(&events, |e| matches!(e, EndpointEvent::Stopped));
    assert_eq!(server.state(), LoopState::Disposed);
    assert!(matches!(server.send_to("c1", chat(2)), Err(LettuceError::Closed)));
}

#[test]
fn unknown_sender_traffic_depends_on_policy() {
    let server = server();
    let on_server = collect::<Chat>(server.hub());
    let stranger = peer("stranger", &server);
    stranger.send_message(chat(4)).unwrap();
    assert_eq!(on_server.recv_timeout(WAIT).unwrap(), chat(4));

    let strict = server_with(options().strict());
    let events = strict.monitor();
    let on_strict = collect::<Chat>(strict.hub());
    let stranger = peer("stranger", &strict);
    stranger.send_message(chat(5)).unwrap();
    let event = wait_for(&events, |e| failure(e).is_some());
    assert!(matches!(
        failure(&event),
        Some(LettuceError::UnknownSender { type_id: 1000, .. })
    ));
    assert!(on_strict.try_recv().is_err());
    // Not one of the fatal kinds.
    assert_eq!(strict.state(), LoopState::Running);
}

#[test]
fn deregistering_an_unknown_identity_fails() {
    let server = server();
    let events = server.monitor();
    assert!(matches!(
        server.deregister_client("nobody"),
        Err(LettuceError::UnknownSenderDeregistration(_))
    ));

    let client = peer("never-registered", &server);
    let acks = collect::<DeRegisterClientAck>(client.hub());
    client.deregister_from_server().unwrap();
    let event = wait_for(&events, |e| failure(e).is_some());
    assert!(matches!(
        failure(&event),
        Some(LettuceError::UnknownSenderDeregistration(id)) if id == "never-registered"
    ));
    assert!(acks.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn pre_registered_mailbox_is_used_on_registration() {
    let server = server();
    let mailbox = Arc::new(BroadcastHub::new());
    let delivered = collect::<Chat>(&mailbox);
    server
        .pre_register_client_with("known", mailbox.clone(), false)
        .unwrap();
    assert!(!server.is_registered("known"));

    let client = peer("known", &server);
    let acks = collect::<RegisterClientAck>(client.hub());
    client.register_with_server(false, false).unwrap();
    acks.recv_timeout(WAIT).unwrap();
    assert!(server.is_registered("known"));
    assert!(Arc::ptr_eq(&server.client_mailbox("known").unwrap(), &mailbox));

    client.send_message(chat(6)).unwrap();
    assert_eq!(delivered.recv_timeout(WAIT).unwrap(), chat(6));

    assert!(matches!(
        server.pre_register_client("known", false),
        Err(LettuceError::DuplicateRegistration(_))
    ));
}

#[test]
fn self_pre_registration_overrides_the_publish_flag() {
    let server = server();
    let on_server = collect::<Chat>(server.hub());
    let mailbox = Arc::new(BroadcastHub::new());
    let delivered = collect::<Chat>(&mailbox);
    server
        .pre_register_client_with("flagged", mailbox.clone(), false)
        .unwrap();

    let client = peer("flagged", &server);
    register(&client, true);
    assert!(server.client_session("flagged").unwrap().publishes_to_server());
    assert!(Arc::ptr_eq(&server.client_mailbox("flagged").unwrap(), &mailbox));

    client.send_message(chat(7)).unwrap();
    assert_eq!(delivered.recv_timeout(WAIT).unwrap(), chat(7));
    assert_eq!(on_server.recv_timeout(WAIT).unwrap(), chat(7));
}

#[test]
fn second_connection_with_a_live_name_is_refused_and_reported() {
    let server = server();
    let events = server.monitor();
    let first = peer("dup", &server);
    register(&first, false);

    let err = PeerEndpoint::connect("dup", server.local_addr().into(), options(), codec())
        .unwrap_err();
    assert!(matches!(err, LettuceError::Io(_)));

    let event = wait_for(&events, |e| failure(e).is_some());
    assert!(matches!(
        failure(&event),
        Some(LettuceError::DuplicateRegistration(id)) if id == "dup"
    ));

    // The first connection is untouched.
    let on_first = collect::<Chat>(first.hub());
    server.send_to("dup", chat(8)).unwrap();
    assert_eq!(on_first.recv_timeout(WAIT).unwrap(), chat(8));
}

#[test]
fn oversize_messages_are_dropped_not_fatal() {
    let server = server_with(options().with_max_message_size(64));
    let events = server.monitor();
    let on_server = collect::<Chat>(server.hub());
    let client = peer("big", &server);

    client
        .send_message(Chat {
            seq: 1,
            text: "x".repeat(256),
        })
        .unwrap();
    let event = wait_for(&events, |e| failure(e).is_some());
    assert!(matches!(
        failure(&event),
        Some(LettuceError::Decode(DecodeError::TooLarge { max: 64, .. }))
    ));

    client.send_message(chat(2)).unwrap();
    assert_eq!(on_server.recv_timeout(WAIT).unwrap(), chat(2));
    assert_eq!(server.state(), LoopState::Running);
}

#[test]
fn app_deregistration_removes_the_session() {
    let server = server();
    let events = server.monitor();
    let client = peer("kicked", &server);
    register(&client, false);
    let session = server.client_session("kicked").unwrap();

    server.deregister_client("kicked").unwrap();
    wait_for(&events, |e| matches!(e, EndpointEvent::ClientDeregistered(_)));
    assert!(!session.is_registered());
    assert!(server.client_mailbox("kicked").is_none());
}

#[test]
fn peers_talk_directly() {
    let bound = PeerEndpoint::bind(
        "left",
        Endpoint::parse("tcp://127.0.0.1:0").unwrap(),
        options(),
        codec(),
    )
    .unwrap();
    let on_left = collect::<Chat>(bound.hub());

    let right = PeerEndpoint::connect("right", bound.local_addr().unwrap().into(), options(), codec())
        .unwrap();
    let on_right = collect::<Chat>(right.hub());

    right.send_message(chat(1)).unwrap();
    assert_eq!(on_left.recv_timeout(WAIT).unwrap(), chat(1));

    bound.send_message(chat(2)).unwrap();
    assert_eq!(on_right.recv_timeout(WAIT).unwrap(), chat(2));
}

#[test]
fn bound_peer_holds_messages_until_someone_connects() {
    let bound = PeerEndpoint::bind(
        "early",
        Endpoint::parse("tcp://127.0.0.1:0").unwrap(),
        options(),
        codec(),
    )
    .unwrap();
    bound.send_message(chat(1)).unwrap();
    bound.send_message(chat(2)).unwrap();

    // Subscribed before connecting: held messages may arrive during connect.
    let hub = Arc::new(BroadcastHub::new());
    let received = collect::<Chat>(&hub);
    let _late = PeerEndpoint::with_hub(
        "late",
        bound.local_addr().unwrap().into(),
        false,
        options(),
        codec(),
        hub,
    )
    .unwrap();
    assert_eq!(received.recv_timeout(WAIT).unwrap(), chat(1));
    assert_eq!(received.recv_timeout(WAIT).unwrap(), chat(2));
}

#[test]
fn connect_failure_surfaces_from_the_constructor() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let target = Endpoint::from_ip_port("127.0.0.1", port).unwrap();
    let err = PeerEndpoint::connect("nobody-home", target, options(), codec()).unwrap_err();
    assert!(matches!(err, LettuceError::Io(_)));
}

#[test]
fn close_is_idempotent_and_emits_stopped_once() {
    let server = server();
    let events = server.monitor();
    let client = peer("closer", &server);

    client.close();
    server.close();
    server.close();
    drop(server);

    assert_eq!(client.state(), LoopState::Disposed);
    let stopped = events
        .try_iter()
        .filter(|e| matches!(e, EndpointEvent::Stopped))
        .count();
    assert_eq!(stopped, 1);
    assert!(matches!(client.send_message(chat(1)), Err(LettuceError::Closed)));
}
