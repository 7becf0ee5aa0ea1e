//! Integration tests for the throttle controller

use std::sync::Arc;

use rs_knobcab::config::ThrottleConfig;
use rs_knobcab::hal::{LinkCommand, MockLink};
use rs_knobcab::withrottle::ThrottleUpdate;
use rs_knobcab::{
    AddressType, Direction, KnobState, LocoAddress, PressOutcome, ReleaseOutcome, Roster,
    RosterEntry, RotateOutcome, ThrottleController, ThrottleState, TouchOutcome,
};

fn setup() -> (Arc<MockLink>, ThrottleController<MockLink>) {
    let link = Arc::new(MockLink::new());
    let controller = ThrottleController::new(Arc::clone(&link), &ThrottleConfig::default());
    (link, controller)
}

fn sample_roster() -> Roster {
    Roster::from_entries([
        RosterEntry::new("LocoA", 3, AddressType::Short),
        RosterEntry::new("LocoB", 40, AddressType::Long),
    ])
    .0
}

/// Knob `knob` selects the first roster entry for `throttle`.
async fn acquire(c: &ThrottleController<MockLink>, throttle: u8, knob: u8) {
    c.on_knob_touch(throttle, knob).await.unwrap();
    assert!(matches!(
        c.on_knob_press(knob).await.unwrap(),
        PressOutcome::Acquired { .. }
    ));
}

async fn states(c: &ThrottleController<MockLink>, throttle: u8, knob: u8) -> (ThrottleState, KnobState) {
    let t = c.throttle_snapshot(throttle).await.unwrap().state;
    let k = c.knob_snapshots().await.unwrap()[usize::from(knob)].state;
    (t, k)
}

// ============================================================================
// Assignment rules
// ============================================================================

#[tokio::test]
async fn idle_knob_on_unallocated_throttle_starts_selecting() {
    let (_link, c) = setup();
    let out = c.on_knob_touch(0, 0).await.unwrap();
    assert_eq!(out, TouchOutcome::Assigned { knob: KnobState::Selecting });
    assert_eq!(states(&c, 0, 0).await, (ThrottleState::Selecting, KnobState::Selecting));
}

#[tokio::test]
async fn idle_knob_on_unattended_throttle_controls_directly() {
    let (link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 1, 0).await;
    // Move knob 0 away so throttle 1 keeps its loco without a knob
    c.on_knob_touch(2, 0).await.unwrap();
    assert_eq!(c.throttle_snapshot(1).await.unwrap().state, ThrottleState::AllocatedNoKnob);

    let out = c.on_knob_touch(1, 1).await.unwrap();
    assert_eq!(out, TouchOutcome::Assigned { knob: KnobState::Controlling });
    assert_eq!(states(&c, 1, 1).await, (ThrottleState::AllocatedWithKnob, KnobState::Controlling));

    // No new acquisition was needed
    let acquires = link
        .commands()
        .into_iter()
        .filter(|c| matches!(c, LinkCommand::Acquire(..)))
        .count();
    assert_eq!(acquires, 1);
}

#[tokio::test]
async fn controlling_knob_moves_to_unattended_throttle() {
    let (_link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 0, 0).await;
    acquire(&c, 1, 1).await;
    c.on_knob_touch(2, 1).await.unwrap(); // throttle 1 -> no knob

    let out = c.on_knob_touch(1, 0).await.unwrap();
    assert_eq!(out, TouchOutcome::Moved { from: 0, knob: KnobState::Controlling });
    assert_eq!(c.throttle_snapshot(0).await.unwrap().state, ThrottleState::AllocatedNoKnob);
    assert_eq!(states(&c, 1, 0).await, (ThrottleState::AllocatedWithKnob, KnobState::Controlling));
}

#[tokio::test]
async fn controlling_knob_moves_to_empty_throttle_and_selects() {
    let (_link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 0, 0).await;

    let out = c.on_knob_touch(3, 0).await.unwrap();
    assert_eq!(out, TouchOutcome::Moved { from: 0, knob: KnobState::Selecting });
    assert_eq!(c.throttle_snapshot(0).await.unwrap().state, ThrottleState::AllocatedNoKnob);
    assert_eq!(states(&c, 3, 0).await, (ThrottleState::Selecting, KnobState::Selecting));
    assert_eq!(c.roster_selection_snapshot().await.unwrap().roster_index, 0);
}

#[tokio::test]
async fn selecting_knob_abandons_selection_when_moved() {
    let (_link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    c.on_knob_touch(0, 0).await.unwrap();
    c.on_knob_rotate(0, 1).await.unwrap();

    let out = c.on_knob_touch(1, 0).await.unwrap();
    assert_eq!(out, TouchOutcome::Moved { from: 0, knob: KnobState::Selecting });
    assert_eq!(c.throttle_snapshot(0).await.unwrap().state, ThrottleState::Unallocated);
    assert_eq!(c.roster_selection_snapshot().await.unwrap().roster_index, 0);
}

#[tokio::test]
async fn unmatched_touches_change_nothing() {
    let (link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 0, 0).await;
    c.on_knob_touch(1, 1).await.unwrap(); // knob 1 selecting throttle 1
    let before = c.throttle_snapshots().await.unwrap();
    let knobs_before = c.knob_snapshots().await.unwrap();

    // Knob 1 onto a throttle driven by knob 0
    assert_eq!(c.on_knob_touch(0, 1).await.unwrap(), TouchOutcome::Ignored);
    // Knob 0 onto a throttle knob 1 is selecting for
    assert_eq!(c.on_knob_touch(1, 0).await.unwrap(), TouchOutcome::Ignored);
    // A knob touching its own throttle
    assert_eq!(c.on_knob_touch(0, 0).await.unwrap(), TouchOutcome::Ignored);

    assert_eq!(c.throttle_snapshots().await.unwrap(), before);
    assert_eq!(c.knob_snapshots().await.unwrap(), knobs_before);
    assert_eq!(link.commands().len(), 1);
}

#[tokio::test]
async fn two_knobs_never_share_a_throttle() {
    let (_link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();

    // Every state knob 0 can leave throttle 1 in
    for setup_step in 0..3 {
        c.on_throttle_release(1).await.unwrap();
        c.on_throttle_release(0).await.unwrap();
        c.on_knob_touch(1, 0).await.unwrap();
        if setup_step >= 1 {
            c.on_knob_press(0).await.unwrap();
        }
        if setup_step == 2 {
            c.on_knob_touch(0, 0).await.unwrap();
        }

        // Knob 1 from idle and from another throttle
        c.on_knob_touch(1, 1).await.unwrap();
        c.on_knob_touch(3, 1).await.unwrap();
        c.on_knob_touch(1, 1).await.unwrap();

        let knobs = c.knob_snapshots().await.unwrap();
        let on_one = knobs
            .iter()
            .filter(|k| k.throttle == Some(1) && k.state != KnobState::Idle)
            .count();
        assert!(on_one <= 1, "step {setup_step}: {knobs:?}");

        let assigned = c.throttle_snapshot(1).await.unwrap().assigned_knob;
        if let Some(k) = assigned {
            assert_eq!(knobs[usize::from(k)].throttle, Some(1));
        }
        c.on_throttle_release(3).await.unwrap();
    }
}

// ============================================================================
// Speed and direction
// ============================================================================

#[tokio::test]
async fn rotation_crosses_zero_into_reverse() {
    let (link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 0, 0).await;
    c.on_knob_rotate(0, 1).await.unwrap(); // +4 forward
    link.take_commands();

    let out = c.on_knob_rotate(0, -2).await.unwrap();
    assert_eq!(
        out,
        RotateOutcome::Speed { throttle: 0, speed: 4, direction: Direction::Reverse }
    );
    assert_eq!(
        link.take_commands(),
        vec![LinkCommand::Direction(0, Direction::Reverse), LinkCommand::Speed(0, 4)]
    );

    c.on_knob_rotate(0, -1).await.unwrap(); // -8
    let out = c.on_knob_rotate(0, 3).await.unwrap(); // -8 + 12
    assert_eq!(
        out,
        RotateOutcome::Speed { throttle: 0, speed: 4, direction: Direction::Forward }
    );
}

#[tokio::test]
async fn stepping_to_zero_keeps_direction() {
    let (link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 0, 0).await;
    c.on_knob_rotate(0, -2).await.unwrap(); // 8 reverse
    link.take_commands();

    c.on_knob_rotate(0, 2).await.unwrap();
    let snap = c.throttle_snapshot(0).await.unwrap();
    assert_eq!((snap.speed, snap.direction), (0, Direction::Reverse));
    assert_eq!(link.take_commands(), vec![LinkCommand::Speed(0, 0)]);
}

#[tokio::test]
async fn steps_per_click_is_configurable() {
    let link = Arc::new(MockLink::new());
    let c = ThrottleController::new(
        Arc::clone(&link),
        &ThrottleConfig::default().with_steps_per_click(10),
    );
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 0, 0).await;
    c.on_knob_rotate(0, 2).await.unwrap();
    assert_eq!(c.throttle_snapshot(0).await.unwrap().speed, 20);

    assert_eq!(c.set_steps_per_click(0).await.unwrap(), 1);
    c.on_knob_rotate(0, 1).await.unwrap();
    assert_eq!(c.throttle_snapshot(0).await.unwrap().speed, 21);
}

#[tokio::test]
async fn protocol_update_merges_with_local_write() {
    let (_link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 0, 0).await;
    c.on_knob_rotate(0, 5).await.unwrap(); // 20 forward, optimistic

    // Server reports direction only; the optimistic speed stays
    let mut update = ThrottleUpdate::empty(0, LocoAddress::short(3));
    update.direction = Some(Direction::Reverse);
    assert!(c.on_protocol_update(&update).await.unwrap());

    let snap = c.throttle_snapshot(0).await.unwrap();
    assert_eq!((snap.speed, snap.direction), (20, Direction::Reverse));

    // Server speed wins once it reports one
    let mut update = ThrottleUpdate::empty(0, LocoAddress::short(3));
    update.speed = Some(18);
    c.on_protocol_update(&update).await.unwrap();
    assert_eq!(c.throttle_snapshot(0).await.unwrap().speed, 18);
}

// ============================================================================
// Release
// ============================================================================

#[tokio::test]
async fn release_resets_throttle_and_frees_knob() {
    let (link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 2, 1).await;
    c.on_knob_rotate(1, -4).await.unwrap();
    c.toggle_function(2, 0).await.unwrap();
    link.take_commands();

    let out = c.on_throttle_release(2).await.unwrap();
    assert_eq!(out, ReleaseOutcome::Released { knob: Some(1) });
    assert_eq!(link.take_commands(), vec![LinkCommand::Release(2)]);

    let snap = c.throttle_snapshot(2).await.unwrap();
    assert_eq!(snap.state, ThrottleState::Unallocated);
    assert_eq!(snap.speed, 0);
    assert_eq!(snap.direction, Direction::Forward);
    assert_eq!(snap.loco_name, None);
    assert!(c.function_snapshot(2).await.unwrap().is_empty());
    assert_eq!(c.knob_snapshots().await.unwrap()[1].state, KnobState::Idle);
}

#[tokio::test]
async fn release_of_unattended_throttle_frees_no_knob() {
    let (link, c) = setup();
    c.on_roster(sample_roster()).await.unwrap();
    acquire(&c, 0, 0).await;
    c.on_knob_touch(1, 0).await.unwrap();
    link.take_commands();

    let out = c.on_throttle_release(0).await.unwrap();
    assert_eq!(out, ReleaseOutcome::Released { knob: None });
    assert_eq!(link.commands(), vec![LinkCommand::Release(0)]);
    // Knob 0 is still selecting for throttle 1
    assert_eq!(states(&c, 1, 0).await, (ThrottleState::Selecting, KnobState::Selecting));
}
