//! Decode a payload and dispatch it through a hub, the path every endpoint
//! takes for inbound traffic.

use lettuce_core::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Position {
    x: i32,
    y: i32,
}

impl Message for Position {
    const TYPE_ID: u32 = 2000;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Heartbeat {}

impl Message for Heartbeat {
    const TYPE_ID: u32 = 2001;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Intruder {}

impl Message for Intruder {
    const TYPE_ID: u32 = 2050;
}

fn registry() -> MessageRegistry {
    let mut builder = RegistryBuilder::new();
    builder
        .module("game", 2000..=2049)
        .unwrap()
        .register::<Position>()
        .unwrap()
        .register::<Heartbeat>()
        .unwrap();
    builder.build()
}

#[test]
fn decoded_payload_reaches_typed_subscribers_only() {
    let registry = registry();
    let hub = BroadcastHub::new();
    let positions = Arc::new(AtomicUsize::new(0));
    let heartbeats = Arc::new(AtomicUsize::new(0));

    let p = positions.clone();
    hub.subscribe::<Position, _>(move |pos| {
        assert_eq!(pos, &Position { x: 3, y: -4 });
        p.fetch_add(1, Ordering::SeqCst);
    });
    let h = heartbeats.clone();
    hub.subscribe::<Heartbeat, _>(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    let payload = registry.encode(&Position { x: 3, y: -4 }).unwrap();
    let report = hub.publish(&registry.decode(&payload).unwrap());

    assert_eq!(report.delivered, 1);
    assert_eq!(positions.load(Ordering::SeqCst), 1);
    assert_eq!(heartbeats.load(Ordering::SeqCst), 0);
}

#[test]
fn panicking_subscriber_does_not_stop_the_rest() {
    let registry = registry();
    let hub = BroadcastHub::new();
    let after = Arc::new(AtomicUsize::new(0));

    hub.subscribe::<Heartbeat, _>(|_| panic!("boom"));
    let a = after.clone();
    hub.subscribe::<Heartbeat, _>(move |_| {
        a.fetch_add(1, Ordering::SeqCst);
    });

    let payload = registry.encode(&Heartbeat {}).unwrap();
    let report = hub.publish(&registry.decode(&payload).unwrap());
    assert_eq!((report.delivered, report.failed), (1, 1));
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn unregistered_type_is_an_error_not_a_null() {
    let registry = registry();
    let payload = registry.encode(&Intruder {}).unwrap();
    assert_eq!(
        registry.decode(&payload).unwrap_err(),
        DecodeError::UnknownType(2050)
    );
    assert_eq!(registry.module_of(2050), None);
    assert_eq!(registry.module_of(2001), Some("game"));
}

#[test]
fn registering_outside_the_reserved_range_fails_fast() {
    let mut builder = RegistryBuilder::new();
    let err = builder
        .module("game", 2000..=2049)
        .unwrap()
        .register::<Intruder>()
        .err()
        .unwrap();
    assert!(matches!(err, RegistryError::OutOfRange { type_id: 2050, .. }));
}
