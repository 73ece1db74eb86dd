use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vtime::{BaseClockSource, ClockEntry, ClockSource, Direction, Handler, HostClockConfig};
use vtime_machine::{
    LimitTimer, LimitTimerConfig, MachineClock, MachineClockConfig, SyncUnitPolicy,
    DEFAULT_SYNC_UNIT,
};

fn machine_on_base(config: MachineClockConfig) -> (Arc<MachineClock>, Arc<BaseClockSource>) {
    let machine = Arc::new(MachineClock::new(config).unwrap());
    let source = Arc::new(BaseClockSource::new());
    machine.set_clock_source(Arc::clone(&source) as _).unwrap();
    (machine, source)
}

#[test]
fn config_defaults() {
    let config = MachineClockConfig::default();
    assert_eq!(config.name, "machine");
    assert_eq!(config.sync_unit, DEFAULT_SYNC_UNIT);
    assert_eq!(config.sync_unit_policy, SyncUnitPolicy::ShowWarning);
}

#[test]
fn config_builder() {
    let config = MachineClockConfig::builder()
        .name("cpu-cluster")
        .sync_unit(250)
        .sync_unit_policy(SyncUnitPolicy::Adjust)
        .host_clock(HostClockConfig::builder().thread_name("cluster-time").build())
        .build();

    assert_eq!(config.name, "cpu-cluster");
    assert_eq!(config.sync_unit, 250);
    assert_eq!(config.sync_unit_policy, SyncUnitPolicy::Adjust);
    assert_eq!(config.host_clock.thread_name, "cluster-time");

    let machine = MachineClock::new(config).unwrap();
    assert_eq!(machine.name(), "cpu-cluster");
    assert_eq!(machine.sync_unit().unwrap(), 250);
}

#[test]
fn entries_follow_the_machine_to_a_new_source() {
    let (machine, source) = machine_on_base(MachineClockConfig::default());

    assert!(!machine.is_host_driven());
    assert!(!machine.host_time_clock_source().has_entries());
    assert_eq!(source.get_all_clock_entries().len(), 2);

    machine.use_host_time_clock_source().unwrap();
    assert!(machine.is_host_driven());
    assert!(!source.has_entries());
    assert_eq!(machine.host_time_clock_source().get_all_clock_entries().len(), 2);
}

#[test]
fn adjust_policy_lowers_the_sync_unit() {
    let config = MachineClockConfig::builder()
        .sync_unit_policy(SyncUnitPolicy::Adjust)
        .build();
    let (machine, _source) = machine_on_base(config);

    // 10 ms sync unit serves up to 100 Hz.
    machine.check_frequency("rtc", 100).unwrap();
    assert_eq!(machine.sync_unit().unwrap(), DEFAULT_SYNC_UNIT);

    machine.check_frequency("uart", 1_000).unwrap();
    assert_eq!(machine.sync_unit().unwrap(), 1_000);

    machine.check_frequency("cpu", 10_000_000).unwrap();
    assert_eq!(machine.sync_unit().unwrap(), 1);
}

#[test]
fn warning_policy_keeps_the_sync_unit() {
    let (machine, _source) = machine_on_base(MachineClockConfig::default());

    machine.check_frequency("uart", 1_000).unwrap();
    assert_eq!(machine.sync_unit().unwrap(), DEFAULT_SYNC_UNIT);
    assert!(machine.check_frequency("broken", 0).is_err());
}

#[test]
fn limit_timer_runs_on_machine_clock() {
    let (machine, source) = machine_on_base(MachineClockConfig::default());
    let timer = LimitTimer::new(
        Arc::clone(&machine) as Arc<dyn ClockSource>,
        LimitTimerConfig::new(1_000_000)
            .limit(100)
            .direction(Direction::Ascending)
            .enabled(true)
            .event_enabled(true),
    )
    .unwrap();

    assert_eq!(source.get_all_clock_entries().len(), 3);
    source.advance(150, false).unwrap();
    assert!(timer.interrupt());
    assert_eq!(timer.value().unwrap(), 50);

    drop(timer);
    assert_eq!(source.get_all_clock_entries().len(), 2);
}

#[test]
fn host_driven_machine_advances_after_start() {
    let machine = MachineClock::new(MachineClockConfig::default()).unwrap();
    assert_eq!(machine.elapsed_virtual_time().unwrap(), Duration::ZERO);

    machine.start();
    thread::sleep(Duration::from_millis(100));
    machine.pause();

    let elapsed = machine.elapsed_virtual_time().unwrap();
    assert!(elapsed > Duration::ZERO, "no virtual time elapsed");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(machine.elapsed_virtual_time().unwrap(), elapsed);
}

#[test]
fn switching_sources_while_a_handler_uses_the_machine() {
    let (machine, first) = machine_on_base(MachineClockConfig::default());
    let in_handler = Arc::new(AtomicBool::new(false));
    let handler = {
        let machine = Arc::downgrade(&machine);
        let in_handler = Arc::clone(&in_handler);
        Handler::new(move || {
            if in_handler.swap(true, Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
            if let Some(machine) = machine.upgrade() {
                // Served by whichever source is current by now.
                let _ = machine.sync_unit();
            }
        })
    };
    machine.add_clock_entry(ClockEntry::new(10, 1, handler)).unwrap();

    let advancing = {
        let first = Arc::clone(&first);
        thread::spawn(move || first.advance(10, false).unwrap())
    };
    while !in_handler.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    let second = Arc::new(BaseClockSource::new());
    machine.set_clock_source(Arc::clone(&second) as _).unwrap();
    advancing.join().unwrap();

    assert!(!first.has_entries());
    assert_eq!(second.get_all_clock_entries().len(), 3);
    assert_eq!(machine.sync_unit().unwrap(), DEFAULT_SYNC_UNIT);
}
