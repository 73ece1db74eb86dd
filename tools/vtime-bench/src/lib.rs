//! Workloads exercised by the `vtime-bench` command line tool.
//!
//! Each workload builds its clock sources from scratch, runs to completion and
//! returns a report that the binary prints.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use log::{debug, info};
use vtime::{
    BaseClockSource, ClockEntry, ClockSource, Handler, HostTimeClockSource, SyncDomain,
    SynchronizationDomain,
};
use vtime_machine::{MachineClock, MachineClockConfig};

/// Outcome of a workload run.
#[derive(Debug, Clone)]
pub struct Report {
    pub name: &'static str,
    pub wall: Duration,
    pub virtual_ticks: i64,
    pub events: u64,
    pub expected_events: Option<u64>,
}

impl Report {
    pub fn events_per_second(&self) -> f64 {
        let secs = self.wall.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.events as f64 / secs
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<10} wall={:.3?} ticks={:>12} events={:>10} ({:.0}/s)",
            self.name,
            self.wall,
            self.virtual_ticks,
            self.events,
            self.events_per_second()
        )?;
        if let Some(expected) = self.expected_events {
            write!(f, " expected={expected}")?;
        }
        Ok(())
    }
}

fn counting_handler(counter: &Arc<AtomicU64>) -> Handler {
    let counter = Arc::clone(counter);
    Handler::new(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    })
}

/// Parameters of [`advance`].
#[derive(Debug, Clone, Copy)]
pub struct AdvanceParams {
    pub entries: i64,
    pub min_period: i64,
    pub ticks: i64,
    pub step: i64,
}

/// Advances a single [`BaseClockSource`] carrying `entries` periodic entries
/// with periods `min_period..min_period + entries`.
pub fn advance(params: AdvanceParams) -> Result<Report> {
    ensure!(params.entries > 0, "at least one entry is required");
    ensure!(params.min_period > 0, "periods must be positive");
    ensure!(params.step > 0, "step must be positive");

    let source = BaseClockSource::new();
    let fired = Arc::new(AtomicU64::new(0));
    let mut expected = 0;
    for period in params.min_period..params.min_period + params.entries {
        source
            .add_clock_entry(ClockEntry::new(period, 1, counting_handler(&fired)))
            .with_context(|| format!("registering entry with period {period}"))?;
        expected += (params.ticks / period) as u64;
    }
    debug!("advance: {} entries registered", params.entries);

    let started = Instant::now();
    let mut remaining = params.ticks;
    while remaining > 0 {
        let step = remaining.min(params.step);
        source.advance(step, false)?;
        remaining -= step;
    }

    Ok(Report {
        name: "advance",
        wall: started.elapsed(),
        virtual_ticks: source.current_value(),
        events: fired.load(Ordering::Relaxed),
        expected_events: Some(expected),
    })
}

/// Runs `phases` barrier phases over `threads` participants of one domain.
pub fn sync(threads: usize, phases: usize) -> Result<Report> {
    ensure!(threads > 0, "at least one participant is required");

    let domain = SynchronizationDomain::new();
    let synchronizers: Vec<_> = (0..threads).map(|_| domain.provide_synchronizer()).collect();

    let started = Instant::now();
    let workers: Vec<_> = synchronizers
        .into_iter()
        .map(|synchronizer| {
            thread::spawn(move || -> Result<()> {
                for _ in 0..phases {
                    synchronizer.sync()?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("participant panicked"))??;
    }

    Ok(Report {
        name: "sync",
        wall: started.elapsed(),
        virtual_ticks: 0,
        events: domain.synchronizations_count() as u64,
        expected_events: Some(phases as u64),
    })
}

/// Parameters of [`machines`].
#[derive(Debug, Clone, Copy)]
pub struct MachinesParams {
    pub machines: usize,
    pub sync_unit: i64,
    pub ticks: i64,
    pub step: i64,
}

/// Drives `machines` emulated machines, each on its own thread, in one
/// synchronization domain.
pub fn machines(params: MachinesParams) -> Result<Report> {
    ensure!(params.machines > 0, "at least one machine is required");
    ensure!(params.step > 0, "step must be positive");

    let domain = Arc::new(SynchronizationDomain::new());
    let mut rigs = Vec::with_capacity(params.machines);
    for index in 0..params.machines {
        let config = MachineClockConfig::builder()
            .name(format!("machine-{index}"))
            .sync_unit(params.sync_unit)
            .build();
        let machine = MachineClock::new(config)?;
        let source = Arc::new(BaseClockSource::new());
        machine.set_clock_source(Arc::clone(&source) as Arc<dyn ClockSource>)?;
        machine.set_sync_domain(Arc::clone(&domain) as Arc<dyn SyncDomain>)?;
        rigs.push((machine, source));
    }
    info!("machines: {} machines in one domain", params.machines);

    let started = Instant::now();
    let workers: Vec<_> = rigs
        .iter()
        .map(|(_, source)| {
            let source = Arc::clone(source);
            thread::spawn(move || -> Result<()> {
                let mut remaining = params.ticks;
                while remaining > 0 {
                    let step = remaining.min(params.step);
                    source.advance(step, false)?;
                    remaining -= step;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("machine thread panicked"))??;
    }

    Ok(Report {
        name: "machines",
        wall: started.elapsed(),
        virtual_ticks: params.ticks,
        events: domain.synchronizations_count() as u64,
        expected_events: Some((params.ticks / params.sync_unit.max(1)) as u64),
    })
}

/// Lets a [`HostTimeClockSource`] drive a `frequency` Hz entry for `duration`
/// of host time.
pub fn host(frequency: i64, duration: Duration) -> Result<Report> {
    let source = HostTimeClockSource::new();
    let fired = Arc::new(AtomicU64::new(0));
    let ratio = ClockEntry::frequency_to_ratio(frequency)?.ratio;
    source.add_clock_entry(ClockEntry::new(1, ratio, counting_handler(&fired)))?;

    let started = Instant::now();
    source.start();
    thread::sleep(duration);
    source.pause();
    let wall = started.elapsed();

    Ok(Report {
        name: "host",
        wall,
        virtual_ticks: source.current_value(),
        events: fired.load(Ordering::Relaxed),
        expected_events: Some((wall.as_secs_f64() * frequency as f64) as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_fires_every_period() {
        let report = advance(AdvanceParams {
            entries: 4,
            min_period: 10,
            ticks: 1_000,
            step: 7,
        })
        .unwrap();

        assert_eq!(report.virtual_ticks, 1_000);
        assert_eq!(Some(report.events), report.expected_events);
    }

    #[test]
    fn sync_counts_every_phase() {
        let report = sync(3, 25).unwrap();
        assert_eq!(report.events, 25);
    }

    #[test]
    fn machines_meet_once_per_sync_unit() {
        let report = machines(MachinesParams {
            machines: 2,
            sync_unit: 100,
            ticks: 1_000,
            step: 30,
        })
        .unwrap();
        assert_eq!(Some(report.events), report.expected_events);
    }

    #[test]
    fn rejects_empty_workloads() {
        assert!(sync(0, 1).is_err());
        assert!(advance(AdvanceParams {
            entries: 0,
            min_period: 1,
            ticks: 1,
            step: 1,
        })
        .is_err());
    }
}
