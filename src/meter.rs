use crate::error::Error;
use crate::registry::Registry;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const POWER_MAX_AGE: Duration = Duration::from_secs(60);
pub const DC_VOLTAGE_MAX_AGE: Duration = Duration::from_secs(60);
pub const BATTERY_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::L1 => "l1",
            Phase::L2 => "l2",
            Phase::L3 => "l3",
        }
    }

    pub fn all() -> [Phase; 3] {
        [Phase::L1, Phase::L2, Phase::L3]
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(Phase::L1),
            "l2" => Ok(Phase::L2),
            "l3" => Ok(Phase::L3),
            other => Err(Error::InvalidArgument(format!("phase not valid: {other:?}"))),
        }
    }
}

static PHASE_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"phase="(l\d+)""#).unwrap());

/// Extract a phase from a fingerprint's `phase="lN"` label, if present and
/// one of the known phases.
pub fn phase_label(fingerprint: &str) -> Option<Phase> {
    let capture = PHASE_LABEL.captures(fingerprint)?;
    capture.get(1)?.as_str().parse().ok()
}

pub fn has_label(fingerprint: &str, key: &str, value: &str) -> bool {
    fingerprint.contains(&format!("{key}=\"{value}\""))
}

/// Classification capability every meter exposes: pure predicates over
/// fingerprint strings plus freshness-checked value lookups implemented in
/// terms of them.
pub trait MeterClassifier: Send + Sync {
    fn registry(&self) -> &Registry;

    /// Phase this fingerprint carries a per-phase power reading for, if any.
    fn power_metric_classifier(&self, fingerprint: &str) -> Option<Phase>;

    /// Whether this fingerprint is the meter's total power reading.
    fn total_power_metric_classifier(&self, fingerprint: &str) -> bool;

    fn power(&self, phase: Phase, max_age: Duration) -> Result<f64, Error> {
        metric_value(
            self.registry(),
            max_age,
            &format!("power phase '{phase}'"),
            |fingerprint| self.power_metric_classifier(fingerprint) == Some(phase),
        )
    }

    fn total_power(&self, max_age: Duration) -> Result<f64, Error> {
        metric_value(self.registry(), max_age, "total power", |fingerprint| {
            self.total_power_metric_classifier(fingerprint)
        })
    }
}

/// Command capability of a meter that can steer the battery inverter. The
/// classifier predicates are required methods; the value accessors are
/// template methods on top of them, so an implementor cannot forget one
/// without failing to compile.
pub trait BatteryController: MeterClassifier {
    fn battery_soc_classifier(&self, fingerprint: &str) -> bool;
    fn dc_voltage_classifier(&self, fingerprint: &str) -> bool;
    fn max_charge_current_classifier(&self, fingerprint: &str) -> bool;

    /// Command one phase of the inverter to the given power. Fire-and-forget;
    /// rejects invalid values synchronously.
    fn setpoint(&self, value: f64, phase: Phase) -> Result<(), Error>;

    fn battery_soc(&self, max_age: Duration) -> Result<f64, Error> {
        metric_value(self.registry(), max_age, "battery soc", |fingerprint| {
            self.battery_soc_classifier(fingerprint)
        })
    }

    fn dc_voltage(&self, max_age: Duration) -> Result<f64, Error> {
        metric_value(self.registry(), max_age, "dc voltage", |fingerprint| {
            self.dc_voltage_classifier(fingerprint)
        })
    }

    fn max_charge_current(&self, max_age: Duration) -> Result<f64, Error> {
        metric_value(self.registry(), max_age, "max charge current", |fingerprint| {
            self.max_charge_current_classifier(fingerprint)
        })
    }

    fn max_charge_power(&self) -> Result<f64, Error> {
        Ok(self.dc_voltage(DC_VOLTAGE_MAX_AGE)? * self.max_charge_current(BATTERY_MAX_AGE)?)
    }
}

/// Find the first entry matching `predicate` and return its value, provided
/// the entry was written within `max_age`.
pub(crate) fn metric_value<P>(
    registry: &Registry,
    max_age: Duration,
    value_name: &str,
    predicate: P,
) -> Result<f64, Error>
where
    P: Fn(&str) -> bool,
{
    let (fingerprint, metric) = registry
        .lookup_by_predicate(predicate)
        .ok_or_else(|| Error::MetricNotFound(value_name.to_string()))?;

    let age = registry.age(&fingerprint).unwrap_or_default();
    if age > max_age {
        return Err(Error::MetricOutdated {
            value_name: value_name.to_string(),
            age: age.as_secs_f64(),
        });
    }

    Ok(metric.value())
}
