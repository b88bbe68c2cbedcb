use std::sync::atomic::{AtomicBool, Ordering};

use crate::transfer::ResultCode;

/// Device state consulted before and during uploads.
pub trait DeviceConditions: Send + Sync {
    /// Connected through an unmetered network.
    fn is_unmetered(&self) -> bool;
    fn is_charging(&self) -> bool;
    fn is_power_saving(&self) -> bool;
}

/// Conditions toggled from configuration or at runtime.
#[derive(Debug)]
pub struct ConditionFlags {
    unmetered: AtomicBool,
    charging: AtomicBool,
    power_saving: AtomicBool,
}

impl ConditionFlags {
    pub fn new(unmetered: bool, charging: bool, power_saving: bool) -> Self {
        Self {
            unmetered: AtomicBool::new(unmetered),
            charging: AtomicBool::new(charging),
            power_saving: AtomicBool::new(power_saving),
        }
    }

    pub fn set_unmetered(&self, value: bool) {
        self.unmetered.store(value, Ordering::SeqCst);
    }

    pub fn set_charging(&self, value: bool) {
        self.charging.store(value, Ordering::SeqCst);
    }

    pub fn set_power_saving(&self, value: bool) {
        self.power_saving.store(value, Ordering::SeqCst);
    }
}

impl Default for ConditionFlags {
    fn default() -> Self {
        Self::new(true, true, false)
    }
}

impl DeviceConditions for ConditionFlags {
    fn is_unmetered(&self) -> bool {
        self.unmetered.load(Ordering::SeqCst)
    }

    fn is_charging(&self) -> bool {
        self.charging.load(Ordering::SeqCst)
    }

    fn is_power_saving(&self) -> bool {
        self.power_saving.load(Ordering::SeqCst)
    }
}

/// Per-upload requirements on the device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadConstraints {
    pub wifi_only: bool,
    pub charging_only: bool,
}

impl UploadConstraints {
    /// The delay code for the first unmet requirement, if any. Power-save
    /// mode defers every upload.
    pub fn violation(&self, conditions: &dyn DeviceConditions) -> Option<ResultCode> {
        if self.wifi_only && !conditions.is_unmetered() {
            Some(ResultCode::DelayedForWifi)
        } else if self.charging_only && !conditions.is_charging() {
            Some(ResultCode::DelayedForCharging)
        } else if conditions.is_power_saving() {
            Some(ResultCode::DelayedInPowerSaveMode)
        } else {
            None
        }
    }
}
