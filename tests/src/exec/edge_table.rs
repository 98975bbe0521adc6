use dbt_exec::EdgeTable;

#[test]
fn record_and_query() {
    let mut t = EdgeTable::new();
    t.record(0x100, 0x2000);
    assert!(t.contains(0x100, 0x2000));
    assert_eq!(t.destination_of(0x100), Some(0x2000));
    assert_eq!(t.sources_of(0x2000), &[0x100]);
    assert_eq!(t.len(), 1);
}

#[test]
fn record_is_idempotent() {
    let mut t = EdgeTable::new();
    t.record(0x100, 0x2000);
    t.record(0x100, 0x2000);
    assert_eq!(t.len(), 1);
    assert_eq!(t.sources_of(0x2000), &[0x100]);
}

#[test]
#[should_panic(expected = "retargeted")]
fn retarget_without_unlink_is_fatal() {
    let mut t = EdgeTable::new();
    t.record(0x100, 0x2000);
    t.record(0x100, 0x3000);
}

#[test]
fn forget_removes_both_directions() {
    let mut t = EdgeTable::new();
    t.record(0x100, 0x2000);
    t.record(0x200, 0x2000);
    assert_eq!(t.forget(0x100), Some(0x2000));
    assert_eq!(t.destination_of(0x100), None);
    assert_eq!(t.sources_of(0x2000), &[0x200]);
    assert_eq!(t.forget(0x100), None);
}

#[test]
fn sources_keep_insertion_order() {
    let mut t = EdgeTable::new();
    t.record(0x300, 0x2000);
    t.record(0x100, 0x2000);
    t.record(0x200, 0x2000);
    assert_eq!(t.sources_of(0x2000), &[0x300, 0x100, 0x200]);
}

#[test]
fn drain_sources_empties_both_directions() {
    let mut t = EdgeTable::new();
    t.record(0x100, 0x2000);
    t.record(0x200, 0x2000);
    t.record(0x300, 0x4000);
    let drained = t.drain_sources(0x2000);
    assert_eq!(drained, &[0x100, 0x200]);
    assert_eq!(t.destination_of(0x100), None);
    assert_eq!(t.destination_of(0x200), None);
    assert!(t.sources_of(0x2000).is_empty());
    assert_eq!(t.len(), 1);
    assert!(t.contains(0x300, 0x4000));
}

#[test]
fn drain_unknown_destination_is_a_no_op() {
    let mut t = EdgeTable::new();
    t.record(0x100, 0x2000);
    assert!(t.drain_sources(0x9000).is_empty());
    assert_eq!(t.len(), 1);
}

#[test]
fn clear_drops_everything() {
    let mut t = EdgeTable::new();
    t.record(0x100, 0x2000);
    t.record(0x200, 0x3000);
    t.clear();
    assert!(t.is_empty());
    assert!(t.sources_of(0x2000).is_empty());
}
