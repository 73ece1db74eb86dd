//! Behaviour shared by every clock source, exercised through `dyn ClockSource`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vtime::{
    BaseClockSource, ClockEntry, ClockError, ClockSource, Direction, Handler, HostTimeClockSource,
    WorkMode,
};

fn sources() -> Vec<Box<dyn ClockSource>> {
    vec![
        Box::new(BaseClockSource::new()),
        Box::new(HostTimeClockSource::new()),
    ]
}

#[test]
fn registration_contract_holds_for_all_sources() {
    for source in sources() {
        let handler = Handler::marker();
        let id = handler.id();
        let entry = ClockEntry::builder(40, -3, handler.clone())
            .direction(Direction::Descending)
            .work_mode(WorkMode::OneShot)
            .enabled(false)
            .build();

        source.add_clock_entry(entry).unwrap();
        assert!(source.has_entries());
        assert_eq!(
            source.add_clock_entry(ClockEntry::new(1, 1, handler)),
            Err(ClockError::DuplicateHandler(id))
        );

        let stored = source.get_clock_entry(id).unwrap();
        assert_eq!(stored.period(), 40);
        assert_eq!(stored.ratio(), -3);
        assert_eq!(stored.value(), 40);
        assert_eq!(stored.direction(), Direction::Descending);
        assert_eq!(stored.work_mode(), WorkMode::OneShot);
        assert!(!stored.enabled());

        assert!(source.remove_clock_entry(id));
        assert!(!source.remove_clock_entry(id));
        assert!(!source.has_entries());
    }
}

#[test]
fn entries_keep_registration_order() {
    for source in sources() {
        let handlers: Vec<_> = (0..5).map(|_| Handler::marker()).collect();
        let entries = handlers
            .iter()
            .enumerate()
            .map(|(index, handler)| ClockEntry::new(index as i64 + 1, 1, handler.clone()))
            .collect();
        source.add_clock_entries(entries).unwrap();

        let ids: Vec<_> = source
            .get_all_clock_entries()
            .iter()
            .map(ClockEntry::handler_id)
            .collect();
        let expected: Vec<_> = handlers.iter().map(Handler::id).collect();
        assert_eq!(ids, expected);

        assert_eq!(source.eject_clock_entries().len(), 5);
        assert!(!source.has_entries());
    }
}

#[test]
fn entries_migrate_to_an_explicitly_advanced_source() {
    let host = HostTimeClockSource::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&counter);
    let handler = Handler::new(move || {
        probe.fetch_add(1, Ordering::SeqCst);
    });
    let id = handler.id();
    host.add_clock_entry(ClockEntry::new(10, 1, handler)).unwrap();

    // Paused host time never advances, so the entry is moved untouched.
    let base = BaseClockSource::new();
    base.add_clock_entries(host.eject_clock_entries()).unwrap();
    assert!(!host.is_running());

    base.advance(25, false).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(base.get_clock_entry(id).unwrap().value(), 5);
}

#[test]
fn frequency_helpers_drive_entry_rate() {
    let source = BaseClockSource::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&counter);
    let ratio = ClockEntry::frequency_to_ratio(1_000).unwrap().ratio;
    let entry = ClockEntry::new(
        1,
        ratio,
        Handler::new(move || {
            probe.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(entry.frequency(), 1_000.0);
    source.add_clock_entry(entry).unwrap();

    // One second of virtual time.
    source.advance(vtime::units::TICKS_PER_SECOND, false).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1_000);
}
