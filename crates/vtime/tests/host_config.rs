//! Tests for the host clock configuration builder.

use std::time::Duration;

use vtime::{ClockSource, HostClockConfig, HostTimeClockSource};

#[test]
fn host_config_default() {
    let config = HostClockConfig::default();

    assert_eq!(config.max_wait_ticks, 10_000_000);
    assert_eq!(config.thread_name, "HostTimeClockSource");
}

#[test]
fn host_config_builder() {
    let config = HostClockConfig::builder()
        .max_wait(Duration::from_millis(250))
        .thread_name("machine-0-clock")
        .build();

    assert_eq!(config.max_wait_ticks, 250_000);
    assert_eq!(config.thread_name, "machine-0-clock");
}

#[test]
fn host_config_never_waits_zero_ticks() {
    let config = HostClockConfig::builder().max_wait(Duration::ZERO).build();

    assert_eq!(config.max_wait_ticks, 1);
}

#[test]
fn host_source_with_custom_config() {
    let config = HostClockConfig::builder().thread_name("custom").build();
    let source = HostTimeClockSource::with_config(config);

    assert_eq!(source.config().thread_name, "custom");
    assert!(source.is_host_driven());
    assert!(source.is_paused());
    assert!(!source.has_entries());
}
