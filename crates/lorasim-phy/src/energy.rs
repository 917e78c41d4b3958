//! Battery bookkeeping for end devices.

use lorasim_common::{EnergyConsumption, PhyState, SimTime};
use serde::{Deserialize, Serialize};

/// Supply voltage and per-state current draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyRates {
    /// Supply voltage in volts.
    pub voltage_v: f64,
    /// Current while transmitting, in amperes.
    pub tx_current_a: f64,
    /// Current while receiving.
    pub rx_current_a: f64,
    /// Current in standby.
    pub standby_current_a: f64,
    /// Current while sleeping.
    pub sleep_current_a: f64,
}

impl Default for EnergyRates {
    fn default() -> Self {
        EnergyRates {
            voltage_v: 3.3,
            tx_current_a: 0.028,
            rx_current_a: 0.0112,
            standby_current_a: 0.0014,
            sleep_current_a: 0.0000015,
        }
    }
}

impl EnergyRates {
    /// Power draw in watts for a radio state. Zero once dead.
    pub fn power_w(&self, state: PhyState) -> f64 {
        let current = match state {
            PhyState::Tx => self.tx_current_a,
            PhyState::Rx => self.rx_current_a,
            PhyState::Standby => self.standby_current_a,
            PhyState::Sleep => self.sleep_current_a,
            PhyState::Dead => 0.0,
        };
        current * self.voltage_v
    }
}

/// Cumulative consumption and remaining battery of one device.
#[derive(Debug, Clone)]
pub struct EnergyAccount {
    rates: EnergyRates,
    capacity_j: Option<f64>,
    remaining_j: f64,
    consumption: EnergyConsumption,
    exhausted: bool,
}

impl EnergyAccount {
    /// Create an account. `capacity_j == None` means mains powered.
    pub fn new(rates: EnergyRates, capacity_j: Option<f64>) -> Self {
        EnergyAccount {
            rates,
            capacity_j,
            remaining_j: capacity_j.unwrap_or(f64::INFINITY),
            consumption: EnergyConsumption::default(),
            exhausted: false,
        }
    }

    /// Charge `duration` spent in `state`.
    ///
    /// Returns `true` exactly once: on the call that brings the battery to
    /// zero or below. Later calls are ignored.
    pub fn charge(&mut self, state: PhyState, duration: SimTime) -> bool {
        if self.exhausted {
            return false;
        }
        let joules = self.rates.power_w(state) * duration.as_secs_f64();
        match state {
            PhyState::Tx => self.consumption.tx_j += joules,
            PhyState::Rx => self.consumption.rx_j += joules,
            PhyState::Standby => self.consumption.standby_j += joules,
            PhyState::Sleep => self.consumption.sleep_j += joules,
            PhyState::Dead => {}
        }
        if self.capacity_j.is_none() {
            return false;
        }
        self.remaining_j = (self.remaining_j - joules).max(0.0);
        if self.remaining_j <= 0.0 {
            self.exhausted = true;
        }
        self.exhausted
    }

    /// Per-state consumption so far.
    pub fn consumption(&self) -> EnergyConsumption {
        self.consumption
    }

    /// Remaining battery energy, infinite when mains powered.
    pub fn remaining_j(&self) -> f64 {
        self.remaining_j
    }

    /// Whether the battery has run out.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Rates in use.
    pub fn rates(&self) -> &EnergyRates {
        &self.rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_accumulates_per_state() {
        let mut account = EnergyAccount::new(EnergyRates::default(), None);
        account.charge(PhyState::Tx, SimTime::from_secs(1.0));
        account.charge(PhyState::Sleep, SimTime::from_secs(10.0));
        let c = account.consumption();
        assert!((c.tx_j - 0.028 * 3.3).abs() < 1e-12);
        assert!((c.sleep_j - 10.0 * 0.0000015 * 3.3).abs() < 1e-15);
        assert_eq!(c.rx_j, 0.0);
        assert!(account.remaining_j().is_infinite());
    }

    #[test]
    fn test_exhaustion_reported_once() {
        // 0.1 J lasts a little over one second of TX at 92.4 mW.
        let mut account = EnergyAccount::new(EnergyRates::default(), Some(0.1));
        assert!(!account.charge(PhyState::Tx, SimTime::from_secs(1.0)));
        assert!(account.charge(PhyState::Tx, SimTime::from_secs(1.0)));
        assert!(account.is_exhausted());
        assert_eq!(account.remaining_j(), 0.0);
        assert!(!account.charge(PhyState::Tx, SimTime::from_secs(1.0)));
        // No further consumption recorded after exhaustion.
        assert!((account.consumption().tx_j - 2.0 * 0.0924).abs() < 1e-12);
    }

    #[test]
    fn test_remaining_never_increases() {
        let mut account = EnergyAccount::new(EnergyRates::default(), Some(5.0));
        let mut last = account.remaining_j();
        for state in [PhyState::Standby, PhyState::Rx, PhyState::Sleep, PhyState::Tx] {
            account.charge(state, SimTime::from_millis(500));
            assert!(account.remaining_j() <= last);
            last = account.remaining_j();
        }
    }
}
