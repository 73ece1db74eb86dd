//! Machine clock configuration.

use vtime::HostClockConfig;

/// Number of ticks between two synchronization points of a new machine.
pub const DEFAULT_SYNC_UNIT: i64 = 10_000;

/// Reaction to a device running faster than the sync unit allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncUnitPolicy {
    /// Log a warning and keep the sync unit.
    #[default]
    ShowWarning,
    /// Lower the sync unit so that the device frequency is reachable.
    Adjust,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MachineClockConfig {
    pub name: String,
    pub sync_unit: i64,
    pub sync_unit_policy: SyncUnitPolicy,
    pub host_clock: HostClockConfig,
}

impl Default for MachineClockConfig {
    fn default() -> Self {
        Self {
            name: String::from("machine"),
            sync_unit: DEFAULT_SYNC_UNIT,
            sync_unit_policy: SyncUnitPolicy::default(),
            host_clock: HostClockConfig::default(),
        }
    }
}

impl MachineClockConfig {
    pub fn builder() -> MachineClockConfigBuilder {
        MachineClockConfigBuilder::default()
    }
}

/// Builder for [`MachineClockConfig`].
#[derive(Debug, Clone, Default)]
pub struct MachineClockConfigBuilder {
    config: MachineClockConfig,
}

impl MachineClockConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn sync_unit(mut self, ticks: i64) -> Self {
        self.config.sync_unit = ticks;
        self
    }

    pub fn sync_unit_policy(mut self, policy: SyncUnitPolicy) -> Self {
        self.config.sync_unit_policy = policy;
        self
    }

    pub fn host_clock(mut self, config: HostClockConfig) -> Self {
        self.config.host_clock = config;
        self
    }

    pub fn build(self) -> MachineClockConfig {
        self.config
    }
}
