//! End-to-end flows: real rooms, real clients, in-memory wires.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use weft_client::MemoryKvBackend;
use weft_server::Permission;
use weft_test::helpers::{full, partial, Harness};

const SECOND: Duration = Duration::from_secs(1);

/// Surfaces room and adapter logs when a scenario fails; run with
/// `RUST_LOG=debug` to watch the frames flow.
fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn two_clients_converge() {
    init_logs();
    let mut harness = Harness::new();
    let mut a = harness.client("alice");
    let mut b = harness.client("bob");
    a.init(harness.now).unwrap();
    b.init(harness.now).unwrap();

    a.world_mut().edit("e1/Pos", full(&[("x", 10), ("y", 20)]));
    harness.exchange(&mut [&mut a, &mut b]);

    assert_eq!(b.world().int_field("e1/Pos", "x"), Some(10));
    assert_eq!(harness.room.borrow().timestamp(), 1);

    harness.advance(SECOND);
    b.world_mut().edit("e1/Pos", partial(&[("x", 30)]));
    harness.exchange(&mut [&mut a, &mut b]);

    assert_eq!(a.world().int_field("e1/Pos", "x"), Some(30));
    assert_eq!(a.world().int_field("e1/Pos", "y"), Some(20));
    assert_eq!(harness.room.borrow().timestamp(), 2);
}

#[test]
fn a_late_joiner_catches_up() {
    init_logs();
    let mut harness = Harness::new();
    let mut a = harness.client("alice");
    a.init(harness.now).unwrap();

    a.world_mut().edit("e1/Pos", full(&[("x", 10), ("y", 20)]));
    harness.exchange(&mut [&mut a]);
    harness.advance(SECOND);
    a.world_mut().edit("e2/Pos", full(&[("x", 1)]));
    harness.exchange(&mut [&mut a]);

    // Bob connects afterwards; his reconnect request earns him the diff.
    let mut b = harness.client("bob");
    b.init(harness.now).unwrap();
    harness.exchange(&mut [&mut a, &mut b]);

    assert_eq!(b.world().int_field("e1/Pos", "y"), Some(20));
    assert_eq!(b.world().int_field("e2/Pos", "x"), Some(1));
}

#[test]
fn deletions_propagate_and_survive_reconnects() {
    init_logs();
    let mut harness = Harness::new();
    let mut a = harness.client("alice");
    a.init(harness.now).unwrap();

    a.world_mut().edit("e1/Pos", full(&[("x", 10)]));
    harness.exchange(&mut [&mut a]);
    harness.advance(SECOND);
    a.world_mut()
        .edit("e1/Pos", weft_shared::ComponentValue::Tombstone);
    harness.exchange(&mut [&mut a]);

    let mut b = harness.client("bob");
    b.init(harness.now).unwrap();
    harness.exchange(&mut [&mut a, &mut b]);

    assert_eq!(b.world().get("e1/Pos"), None);
}

#[test]
fn ephemeral_cursors_appear_and_vanish_with_their_client() {
    init_logs();
    let mut harness = Harness::new();
    let mut a = harness.client("alice");
    let mut b = harness.client("bob");
    a.init(harness.now).unwrap();
    b.init(harness.now).unwrap();

    a.world_mut().edit("alice/Cursor", full(&[("x", 50), ("y", 100)]));
    harness.exchange(&mut [&mut a, &mut b]);

    assert_eq!(b.world().int_field("alice/Cursor", "x"), Some(50));
    // Cursors never advance the document timestamp or reach storage.
    assert_eq!(harness.room.borrow().timestamp(), 0);

    // A third client connecting later gets the cursor snapshot on connect.
    let mut c = harness.client("carol");
    c.init(harness.now).unwrap();
    harness.exchange(&mut [&mut a, &mut b, &mut c]);
    assert_eq!(c.world().int_field("alice/Cursor", "x"), Some(50));

    // Alice leaves; her cursor is tombstoned for everyone.
    a.disconnect(harness.now);
    harness.exchange(&mut [&mut b, &mut c]);
    assert_eq!(b.world().get("alice/Cursor"), None);
    assert_eq!(c.world().get("alice/Cursor"), None);
}

#[test]
fn undo_under_remote_interleave() {
    init_logs();
    let mut harness = Harness::new();
    let mut a = harness.client("alice");
    let mut b = harness.client("bob");
    a.init(harness.now).unwrap();
    b.init(harness.now).unwrap();

    // Seed x=0 from Bob so Alice's history treats it as remote state.
    b.world_mut().edit("e1/Pos", full(&[("x", 0)]));
    harness.exchange(&mut [&mut a, &mut b]);
    assert_eq!(a.world().int_field("e1/Pos", "x"), Some(0));

    // Alice edits to 50, Bob concurrently to 20; Bob's lands later.
    harness.advance(SECOND);
    a.world_mut().edit("e1/Pos", partial(&[("x", 50)]));
    harness.exchange(&mut [&mut a, &mut b]);
    harness.advance(SECOND);
    b.world_mut().edit("e1/Pos", partial(&[("x", 20)]));
    harness.exchange(&mut [&mut a, &mut b]);
    assert_eq!(a.world().int_field("e1/Pos", "x"), Some(20));

    // Undo reverts Alice's own edit to the recorded prior value.
    harness.advance(SECOND);
    assert!(a.undo());
    harness.exchange(&mut [&mut a, &mut b]);
    assert_eq!(a.world().int_field("e1/Pos", "x"), Some(0));
    assert_eq!(b.world().int_field("e1/Pos", "x"), Some(0));

    // Redo restores the pre-undo state, which includes Bob's remote edit.
    harness.advance(SECOND);
    assert!(a.redo());
    harness.exchange(&mut [&mut a, &mut b]);
    assert_eq!(a.world().int_field("e1/Pos", "x"), Some(20));
    assert_eq!(b.world().int_field("e1/Pos", "x"), Some(20));
}

#[test]
fn offline_edits_replay_on_reconnect() {
    init_logs();
    let mut harness = Harness::new();
    let backend = Rc::new(MemoryKvBackend::new());
    let mut a = harness.client_with(
        "alice",
        Permission::ReadWrite,
        Some(backend.clone()),
        |config| config.transport.start_offline = true,
    );
    let mut b = harness.client("bob");
    a.init(harness.now).unwrap();
    b.init(harness.now).unwrap();
    assert!(!a.is_connected());

    // Edits made while offline accumulate locally.
    a.world_mut().edit("e1/Pos", full(&[("x", 5)]));
    harness.exchange(&mut [&mut a, &mut b]);
    assert_eq!(b.world().get("e1/Pos"), None);
    assert_eq!(harness.room.borrow().timestamp(), 0);

    // Going online replays the buffer through the reconnect request.
    harness.advance(SECOND);
    a.reconnect(harness.now);
    harness.exchange(&mut [&mut a, &mut b]);
    assert_eq!(harness.room.borrow().timestamp(), 1);
    assert_eq!(b.world().int_field("e1/Pos", "x"), Some(5));
}

#[test]
fn readonly_clients_observe_but_cannot_write() {
    init_logs();
    let mut harness = Harness::new();
    let mut a = harness.client("alice");
    let mut c = harness.client_with("carol", Permission::ReadOnly, None, |_| {});
    a.init(harness.now).unwrap();
    c.init(harness.now).unwrap();

    c.world_mut().edit("e1/Pos", full(&[("x", 9)]));
    harness.exchange(&mut [&mut a, &mut c]);
    assert_eq!(harness.room.borrow().timestamp(), 0);
    assert_eq!(a.world().get("e1/Pos"), None);

    harness.advance(SECOND);
    a.world_mut().edit("e2/Pos", full(&[("x", 4)]));
    harness.exchange(&mut [&mut a, &mut c]);
    assert_eq!(c.world().int_field("e2/Pos", "x"), Some(4));
}

#[test]
fn a_protocol_mismatch_dooms_the_client_session() {
    init_logs();
    let mut harness = Harness::new();
    let mut a = harness.client_with("alice", Permission::ReadWrite, None, |config| {
        config.transport.protocol_version = 99;
    });
    let reported = Rc::new(Cell::new(0u32));
    let sink = Rc::clone(&reported);
    a.on_version_mismatch(move |version| sink.set(version));
    a.init(harness.now).unwrap();

    harness.exchange(&mut [&mut a]);
    assert_eq!(reported.get(), 1);
    assert!(!a.is_connected());
}

#[test]
fn local_state_persists_without_ever_reaching_the_room() {
    init_logs();
    let mut harness = Harness::new();
    let backend = Rc::new(MemoryKvBackend::new());
    let mut a = harness.client_with("alice", Permission::ReadWrite, Some(backend.clone()), |_| {});
    let mut b = harness.client("bob");
    a.init(harness.now).unwrap();
    b.init(harness.now).unwrap();

    a.world_mut().edit("e1/Prefs", full(&[("zoom", 3)]));
    a.world_mut().edit("e1/Pos", full(&[("x", 2)]));
    harness.exchange(&mut [&mut a, &mut b]);

    // Document state spreads, local state does not.
    assert_eq!(b.world().int_field("e1/Pos", "x"), Some(2));
    assert_eq!(b.world().get("e1/Prefs"), None);

    a.close();

    // A restarted client restores both from its store before any network
    // round-trip.
    let mut a2 = harness.client_with("alice", Permission::ReadWrite, Some(backend), |config| {
        config.transport.start_offline = true;
    });
    a2.init(harness.now).unwrap();
    a2.tick(harness.now);
    assert_eq!(a2.world().int_field("e1/Prefs", "zoom"), Some(3));
    assert_eq!(a2.world().int_field("e1/Pos", "x"), Some(2));
}

#[test]
fn the_room_persists_through_its_throttled_save() {
    init_logs();
    let mut harness = Harness::new();
    let mut a = harness.client("alice");
    a.init(harness.now).unwrap();

    a.world_mut().edit("e1/Pos", full(&[("x", 10)]));
    harness.exchange(&mut [&mut a]);
    assert!(harness.stored.borrow().is_none());

    harness.advance(Duration::from_secs(10));
    harness.room.borrow_mut().poll(harness.now);
    let snapshot = harness.stored.borrow().clone().unwrap();
    assert_eq!(snapshot.timestamp, 1);
    assert!(snapshot.state.contains_key("e1/Pos"));
}
