//! Integration tests for the flow manager
//!
//! These drive `FlowManager` end to end against the simulated device and
//! check what the device holds after each operation.

use std::net::Ipv4Addr;

use flowman::{
    FlowAction, FlowAttr, FlowError, FlowId, FlowItem, FlowManager, FlowManagerConfig,
    FlowState, PciAddress,
};
use flowman_dev::sim::{SimDevice, SimEntry};
use flowman_dev::{ActionOp, CounterStats, DevStatus, Direction, Opcode, VnicHandle};
use pretty_assertions::assert_eq;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manager_with(config: FlowManagerConfig) -> FlowManager<SimDevice> {
    init_logging();
    FlowManager::new(config, SimDevice::new()).unwrap()
}

fn manager() -> FlowManager<SimDevice> {
    manager_with(FlowManagerConfig::default().with_rq_count(8))
}

fn ipv4_pattern() -> Vec<FlowItem> {
    vec![FlowItem::eth(), FlowItem::ipv4()]
}

fn udp_pattern() -> Vec<FlowItem> {
    vec![FlowItem::eth(), FlowItem::ipv4(), FlowItem::udp_dst(4789)]
}

fn jump_to(fm: &mut FlowManager<SimDevice>, group: u32) -> FlowId {
    fm.create(
        &FlowAttr::ingress(0),
        &ipv4_pattern(),
        &[FlowAction::Jump { group }],
    )
    .unwrap()
}

fn queue_in(fm: &mut FlowManager<SimDevice>, group: u32, index: u16) -> FlowId {
    fm.create(
        &FlowAttr::ingress(group),
        &ipv4_pattern(),
        &[FlowAction::Queue { index }],
    )
    .unwrap()
}

fn default_ref(fm: &FlowManager<SimDevice>, direction: Direction) -> u32 {
    let id = fm.tables().default_table(direction).unwrap();
    fm.tables().get(id).unwrap().ref_count()
}

fn group_ref(fm: &FlowManager<SimDevice>, group: u32) -> Option<u32> {
    fm.tables()
        .lookup(group, Direction::Ingress)
        .and_then(|id| fm.tables().get(id))
        .map(|fet| fet.ref_count())
}

/// Table the installed EXACT-MATCH op of a flow points at.
fn jump_target(fm: &FlowManager<SimDevice>, id: FlowId) -> Option<flowman_dev::TableHandle> {
    let rule = fm.flow(id)?;
    fm.device().action(rule.action_handle)?.jump_target()
}

#[test]
fn test_queue_rule_lands_in_tcam() {
    let mut fm = manager();
    let id = fm
        .create(
            &FlowAttr::ingress(0),
            &[
                FlowItem::eth(),
                FlowItem::ipv4_dst(Ipv4Addr::new(10, 0, 0, 1), 32),
            ],
            &[FlowAction::Queue { index: 3 }],
        )
        .unwrap();

    let tcam = fm.tables().tcam_handle(Direction::Ingress);
    assert_eq!(fm.device().entries_in(tcam), 1);
    assert_eq!(
        fm.device()
            .entries_in(fm.tables().tcam_handle(Direction::Egress)),
        0
    );

    let rule = fm.flow(id).unwrap();
    assert!(rule.is_installed());
    assert_eq!(rule.counter, None);
    assert_eq!(
        fm.device().action(rule.action_handle).unwrap().ops()[0],
        ActionOp::RqSteer {
            rq_index: 3,
            rq_count: 1,
            vnic: VnicHandle::NULL
        }
    );

    let err = fm.query_count(id, false).unwrap_err();
    assert!(matches!(err, FlowError::Unsupported(_)));
}

#[test]
fn test_jump_parks_then_converts() {
    let mut fm = manager();
    let default_handle = fm
        .tables()
        .handle(fm.tables().default_table(Direction::Ingress).unwrap())
        .unwrap();

    let r1 = jump_to(&mut fm, 5);
    assert_eq!(fm.pending_jump_count(), 1);
    assert!(fm.is_jump_pending(r1));
    assert_eq!(default_ref(&fm, Direction::Ingress), 2);
    assert_eq!(jump_target(&fm, r1), Some(default_handle));

    let r2 = queue_in(&mut fm, 5, 1);
    assert_eq!(fm.flow_count(), 2);
    assert_eq!(fm.pending_jump_count(), 0);

    let fet = fm.tables().lookup(5, Direction::Ingress).unwrap();
    let handle = fm.tables().handle(fet).unwrap();
    assert_eq!(group_ref(&fm, 5), Some(2));
    assert_eq!(default_ref(&fm, Direction::Ingress), 1);
    assert_eq!(jump_target(&fm, r1), Some(handle));
    assert_eq!(fm.flow(r1).unwrap().fet, Some(fet));
    assert!(fm.flow(r1).unwrap().is_installed());
    assert_eq!(fm.device().entries_in(handle), 1);
    assert_eq!(fm.flow(r2).unwrap().fet, Some(fet));

    assert_eq!(fm.stats().jump_flows_noted, 1);
    assert_eq!(fm.stats().jump_flows_converted, 1);
    assert_eq!(fm.stats().jump_flows_failed, 0);
    assert_eq!(fm.last_jump_conversion().converted, vec![r1]);
    assert!(fm.last_jump_conversion().failed.is_empty());
}

#[test]
fn test_jump_to_open_table_is_not_parked() {
    let mut fm = manager();
    let owner = queue_in(&mut fm, 7, 0);
    let jumper = jump_to(&mut fm, 7);
    assert_eq!(fm.pending_jump_count(), 0);
    assert_eq!(group_ref(&fm, 7), Some(2));

    // The table outlives the rule that created it while a jump targets it.
    fm.destroy(owner).unwrap();
    assert_eq!(group_ref(&fm, 7), Some(1));
    assert_eq!(fm.device().exact_table_count(), 3);

    fm.destroy(jumper).unwrap();
    assert_eq!(group_ref(&fm, 7), None);
    assert_eq!(fm.device().exact_table_count(), 2);
}

#[test]
fn test_destroyed_jump_is_not_converted() {
    let mut fm = manager();
    let r1 = jump_to(&mut fm, 5);
    fm.destroy(r1).unwrap();
    assert_eq!(fm.pending_jump_count(), 0);
    assert_eq!(default_ref(&fm, Direction::Ingress), 1);

    queue_in(&mut fm, 5, 0);
    assert_eq!(fm.stats().jump_flows_converted, 0);
    assert_eq!(group_ref(&fm, 5), Some(1));
}

#[test]
fn test_egress_table_does_not_convert_ingress_jump() {
    let mut fm = manager();
    let r1 = jump_to(&mut fm, 5);
    fm.create(&FlowAttr::egress(5), &ipv4_pattern(), &[FlowAction::Drop])
        .unwrap();

    assert!(fm.is_jump_pending(r1));
    assert_eq!(fm.tables().lookup(5, Direction::Ingress), None);
    assert!(fm.tables().lookup(5, Direction::Egress).is_some());
}

#[test]
fn test_exclusive_fates() {
    let mut fm = manager();
    let combos: Vec<Vec<FlowAction>> = vec![
        vec![FlowAction::Drop, FlowAction::Queue { index: 1 }],
        vec![FlowAction::Jump { group: 3 }, FlowAction::Drop],
        vec![FlowAction::Passthru, FlowAction::Jump { group: 3 }],
        vec![FlowAction::Queue { index: 1 }, FlowAction::Passthru],
        vec![FlowAction::Count, FlowAction::Count],
    ];
    fm.device_mut().clear_history();
    for actions in combos {
        let err = fm
            .create(&FlowAttr::ingress(0), &ipv4_pattern(), &actions)
            .unwrap_err();
        assert!(
            matches!(err, FlowError::InvalidActionCombination(_)),
            "{:?} gave {}",
            actions,
            err
        );
    }
    assert!(fm.device().history().is_empty());
    assert_eq!(fm.flow_count(), 0);
}

#[test]
fn test_group_table_follows_live_flows() {
    let mut fm = manager();
    assert_eq!(fm.device().exact_table_count(), 2);

    let a = queue_in(&mut fm, 9, 0);
    let b = queue_in(&mut fm, 9, 1);
    assert_eq!(fm.device().exact_table_count(), 3);
    assert_eq!(group_ref(&fm, 9), Some(2));

    fm.destroy(a).unwrap();
    assert_eq!(group_ref(&fm, 9), Some(1));
    // A second destroy must not drop the reference held by `b`.
    fm.destroy(a).unwrap();
    assert_eq!(group_ref(&fm, 9), Some(1));

    fm.destroy(b).unwrap();
    assert_eq!(group_ref(&fm, 9), None);
    assert_eq!(fm.device().exact_table_count(), 2);
    assert_eq!(default_ref(&fm, Direction::Ingress), 1);
    assert_eq!(default_ref(&fm, Direction::Egress), 1);
    assert_eq!(fm.stats().tables_created, 1);
    assert_eq!(fm.stats().tables_freed, 1);
}

#[test]
fn test_exact_entry_carries_key_data() {
    let mut fm = manager();
    let id = fm
        .create(
            &FlowAttr::ingress(4),
            &[
                FlowItem::eth(),
                FlowItem::ipv4_dst(Ipv4Addr::new(192, 168, 1, 0), 24),
            ],
            &[FlowAction::Count, FlowAction::Queue { index: 2 }],
        )
        .unwrap();

    let rule = fm.flow(id).unwrap();
    match fm.device().entry(rule.entry_handle).unwrap() {
        SimEntry::Exact { table, entry } => {
            assert_eq!(Some(*table), fm.tables().handle(rule.fet.unwrap()));
            assert_eq!(entry.data, rule.entry.key.data);
            assert_eq!(entry.data[0].ipv4.dst, 0xc0a8_0100);
            assert_eq!(entry.counter, rule.counter);
        }
        other => panic!("expected an exact entry, got {:?}", other),
    }
}

#[test]
fn test_key_mismatch_releases_everything() {
    let mut fm = manager();
    queue_in(&mut fm, 7, 0);
    let actions_before = fm.device().action_count();
    let entries_before = fm.device().entry_count();

    let err = fm
        .create(
            &FlowAttr::ingress(7),
            &udp_pattern(),
            &[FlowAction::Count, FlowAction::Queue { index: 1 }],
        )
        .unwrap_err();
    assert_eq!(
        err,
        FlowError::KeyMismatch {
            group: 7,
            direction: Direction::Ingress
        }
    );
    assert_eq!(fm.device().action_count(), actions_before);
    assert_eq!(fm.device().entry_count(), entries_before);
    assert_eq!(fm.counters().in_use(), 0);
    assert_eq!(group_ref(&fm, 7), Some(1));
    assert_eq!(fm.flow_count(), 1);
}

#[test]
fn test_rollback_on_device_failures() {
    let failures = [
        (Opcode::ActionAlloc, DevStatus::NoMemory),
        (Opcode::EntryInstall, DevStatus::NoSpace),
        (Opcode::TableAlloc, DevStatus::NoSpace),
        (Opcode::CounterQuery, DevStatus::Failure),
    ];
    for (opcode, status) in failures {
        let mut fm = manager();
        let tables_before = fm.device().table_count();
        fm.device_mut().fail_next(opcode, status);

        let result = fm.create(
            &FlowAttr::ingress(3),
            &ipv4_pattern(),
            &[FlowAction::Count, FlowAction::Queue { index: 1 }],
        );
        assert!(result.is_err(), "{} failure was not reported", opcode);
        assert_eq!(fm.flow_count(), 0, "{}", opcode);
        assert_eq!(fm.device().action_count(), 0, "{}", opcode);
        assert_eq!(fm.device().entry_count(), 0, "{}", opcode);
        assert_eq!(fm.device().table_count(), tables_before, "{}", opcode);
        assert_eq!(fm.counters().in_use(), 0, "{}", opcode);
        assert_eq!(fm.tables().open_count(), 0, "{}", opcode);
        assert_eq!(fm.stats().create_failures, 1, "{}", opcode);
    }
}

#[test]
fn test_table_alloc_failure_is_resource_exhaustion() {
    let mut fm = manager();
    fm.device_mut()
        .fail_next(Opcode::TableAlloc, DevStatus::NoSpace);
    let err = fm
        .create(&FlowAttr::ingress(2), &ipv4_pattern(), &[FlowAction::Drop])
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::TableResourceExhausted {
            group: 2,
            direction: Direction::Ingress,
            source: Some(_)
        }
    ));
}

#[test]
fn test_counter_pool_grows_past_first_block() {
    let mut fm = manager_with(FlowManagerConfig {
        counters_expand: 2,
        ..FlowManagerConfig::default().with_rq_count(4)
    });
    assert_eq!(fm.device().counters_total(), 2);

    for _ in 0..3 {
        fm.create(
            &FlowAttr::ingress(0),
            &ipv4_pattern(),
            &[FlowAction::Count, FlowAction::Drop],
        )
        .unwrap();
    }
    assert_eq!(fm.device().counters_total(), 4);
    assert_eq!(fm.counters().in_use(), 3);
}

#[test]
fn test_counter_ceiling_fails_create() {
    let mut fm = manager_with(FlowManagerConfig {
        counters_expand: 2,
        ..FlowManagerConfig::default().with_max_counters(2)
    });
    for _ in 0..2 {
        fm.create(&FlowAttr::ingress(0), &ipv4_pattern(), &[FlowAction::Count])
            .unwrap();
    }
    let err = fm
        .create(&FlowAttr::ingress(0), &ipv4_pattern(), &[FlowAction::Count])
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::CounterResourceExhausted {
            allocated: 2,
            source: None
        }
    ));
    assert_eq!(fm.device().action_count(), 2);
    assert_eq!(fm.flow_count(), 2);
}

#[test]
fn test_recycled_counter_starts_at_zero() {
    let mut fm = manager();
    let first = fm
        .create(&FlowAttr::ingress(0), &ipv4_pattern(), &[FlowAction::Count])
        .unwrap();
    let counter = fm.flow(first).unwrap().counter.unwrap();
    fm.device_mut().set_counter(
        counter,
        CounterStats {
            hits: 10,
            bytes: 1500,
        },
    );
    assert_eq!(
        fm.query(first, &[FlowAction::Count], true).unwrap(),
        Some(CounterStats {
            hits: 10,
            bytes: 1500
        })
    );
    fm.device_mut().set_counter(counter, CounterStats { hits: 3, bytes: 64 });
    fm.destroy(first).unwrap();

    let second = fm
        .create(&FlowAttr::ingress(0), &ipv4_pattern(), &[FlowAction::Count])
        .unwrap();
    assert_eq!(fm.flow(second).unwrap().counter, Some(counter));
    assert_eq!(
        fm.query_count(second, false).unwrap(),
        CounterStats::default()
    );
}

#[test]
fn test_port_id_resolves_vnic() {
    init_logging();
    let peer: PciAddress = "05:00.1".parse().unwrap();
    let config = FlowManagerConfig::default()
        .with_rq_count(4)
        .with_port(1, peer);
    let device = SimDevice::new().with_vnic(peer.bdf(), 0x77);
    let mut fm = FlowManager::new(config, device).unwrap();

    let id = fm
        .create(
            &FlowAttr::ingress(0),
            &ipv4_pattern(),
            &[
                FlowAction::PortId {
                    original: false,
                    id: 1,
                },
                FlowAction::Queue { index: 2 },
            ],
        )
        .unwrap();
    let rule = fm.flow(id).unwrap();
    assert_eq!(
        fm.device().action(rule.action_handle).unwrap().ops()[0],
        ActionOp::RqSteer {
            rq_index: 2,
            rq_count: 1,
            vnic: VnicHandle::from_raw_unchecked(0x77)
        }
    );

    let err = fm
        .create(
            &FlowAttr::ingress(0),
            &ipv4_pattern(),
            &[
                FlowAction::PortId {
                    original: false,
                    id: 2,
                },
                FlowAction::Drop,
            ],
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::UnsupportedAction(_)));
}

#[test]
fn test_failed_conversion_is_best_effort() {
    let mut fm = manager();
    let r1 = jump_to(&mut fm, 5);
    let r2 = jump_to(&mut fm, 5);
    assert_eq!(default_ref(&fm, Direction::Ingress), 3);

    // The group-5 rule's own install goes through; R1's reinstall fails.
    fm.device_mut()
        .fail_nth(Opcode::EntryInstall, 1, DevStatus::NoSpace);
    let r3 = queue_in(&mut fm, 5, 0);

    assert!(fm.flow(r3).unwrap().is_installed());
    assert!(!fm.flow(r1).unwrap().is_installed());
    assert!(fm.flow(r2).unwrap().is_installed());
    assert!(!fm.is_jump_pending(r1));
    assert_eq!(fm.stats().jump_flows_converted, 1);
    assert_eq!(fm.stats().jump_flows_failed, 1);
    let outcome = fm.last_jump_conversion();
    assert_eq!(outcome.converted, vec![r2]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, r1);
    assert!(matches!(
        outcome.failed[0].1,
        FlowError::DeviceCommandFailed(_)
    ));
    assert_eq!(fm.flow_state(r1), Some(FlowState::Uninstalled));
    assert_eq!(group_ref(&fm, 5), Some(2));
    assert_eq!(default_ref(&fm, Direction::Ingress), 2);

    // R1 still holds its default-table reference until destroyed.
    fm.destroy(r1).unwrap();
    assert_eq!(default_ref(&fm, Direction::Ingress), 1);
    assert_eq!(fm.flow_count(), 2);
    assert_eq!(fm.flow_state(r1), Some(FlowState::Destroyed));
}

#[test]
fn test_flush_after_device_closed_sends_nothing() {
    let mut fm = manager();
    jump_to(&mut fm, 5);
    queue_in(&mut fm, 6, 0);
    fm.create(&FlowAttr::ingress(0), &ipv4_pattern(), &[FlowAction::Count])
        .unwrap();

    fm.device_closed();
    fm.device_mut().clear_history();
    fm.flush().unwrap();

    assert!(fm.device().history().is_empty());
    assert_eq!(fm.flow_count(), 0);
    assert_eq!(fm.pending_jump_count(), 0);
    assert_eq!(fm.tables().open_count(), 0);
    assert_eq!(fm.counters().in_use(), 0);
}

#[test]
fn test_shutdown_returns_clean_device() {
    let mut fm = manager();
    jump_to(&mut fm, 5);
    queue_in(&mut fm, 5, 1);
    fm.create(&FlowAttr::egress(0), &ipv4_pattern(), &[FlowAction::Count])
        .unwrap();

    fm.shutdown().unwrap();
    let dev = fm.into_device();
    assert_eq!(dev.table_count(), 0);
    assert_eq!(dev.entry_count(), 0);
    assert_eq!(dev.action_count(), 0);
    assert_eq!(dev.counters_total(), 0);
}

#[test]
fn test_validate_does_not_touch_the_device() {
    let mut fm = manager();
    queue_in(&mut fm, 7, 0);
    fm.device_mut().clear_history();

    fm.validate(
        &FlowAttr::ingress(0),
        &ipv4_pattern(),
        &[FlowAction::Jump { group: 12 }],
    )
    .unwrap();
    let err = fm
        .validate(&FlowAttr::ingress(7), &udp_pattern(), &[FlowAction::Drop])
        .unwrap_err();
    assert!(matches!(err, FlowError::KeyMismatch { group: 7, .. }));

    assert!(fm.device().history().is_empty());
    assert_eq!(fm.flow_count(), 1);
    assert_eq!(fm.pending_jump_count(), 0);
}

#[test]
fn test_rules_and_config_from_json() {
    init_logging();
    let config = FlowManagerConfig::from_json_str(r#"{ "rq_count": 4, "counters_expand": 8 }"#)
        .unwrap();
    let mut fm = FlowManager::new(config, SimDevice::new()).unwrap();

    let attr: FlowAttr = serde_json::from_str(r#"{ "group": 0, "ingress": true }"#).unwrap();
    let pattern: Vec<FlowItem> = serde_json::from_str(
        r#"[
            { "type": "eth" },
            { "type": "ipv4",
              "spec": { "dst": "10.1.2.3" },
              "mask": { "dst": "255.255.255.255" } },
            { "type": "udp" }
        ]"#,
    )
    .unwrap();
    let actions: Vec<FlowAction> = serde_json::from_str(
        r#"[ { "type": "count" }, { "type": "queue", "index": 2 } ]"#,
    )
    .unwrap();

    let id = fm.create(&attr, &pattern, &actions).unwrap();
    let rule = fm.flow(id).unwrap();
    assert_eq!(rule.entry.key.data[0].ipv4.dst, 0x0a01_0203);
    assert_eq!(fm.device().counters_total(), 8);
    assert_eq!(rule.counter.map(|c| c.0), Some(0));
}
