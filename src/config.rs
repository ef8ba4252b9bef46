use crate::charge_controller;
use crate::meter::Phase;

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Vec::new")]
    pub meters: Vec<Meter>,

    pub charge_controller: Option<ChargeController>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Meter {{{
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Meter {
    Janitza(Janitza),
    Seplos(Seplos),
    Victron(Victron),
}

impl Meter {
    pub fn name(&self) -> &str {
        match self {
            Meter::Janitza(m) => &m.name,
            Meter::Seplos(m) => &m.name,
            Meter::Victron(m) => &m.name,
        }
    }
} // }}}

// Janitza {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Janitza {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub unit: Option<u8>,
    pub interval_ms: Option<u64>,
}

impl Janitza {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(502)
    }

    pub fn unit(&self) -> u8 {
        self.unit.unwrap_or(1)
    }

    pub fn interval(&self) -> Duration {
        self.interval_ms
            .map(Duration::from_millis)
            .unwrap_or(crate::janitza::INTERVAL)
    }
} // }}}

// Seplos {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Seplos {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub address: Option<u8>,
    pub interval_ms: Option<u64>,
}

impl Seplos {
    pub fn address(&self) -> u8 {
        self.address.unwrap_or(0)
    }

    pub fn interval(&self) -> Duration {
        self.interval_ms
            .map(Duration::from_millis)
            .unwrap_or(crate::seplos::client::INTERVAL)
    }
} // }}}

// Victron {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Victron {
    pub name: String,
    pub id: String,
    pub mqtt_host: String,
    pub mqtt_port: Option<u16>,
    pub keepalive_interval_secs: Option<u64>,
}

impl Victron {
    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port.unwrap_or(1883)
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(crate::victron::KEEPALIVE_INTERVAL)
    }
} // }}}

// ChargeController {{{
#[derive(Clone, Debug, Deserialize)]
pub struct ChargeController {
    pub grid_meter_name: String,
    pub battery_meter_name: String,
    pub battery_controller_name: String,

    pub charge_limits: Option<BTreeMap<u32, f64>>,
    pub discharge_limits: Option<BTreeMap<u32, f64>>,
    pub target_setpoint: Option<f64>,
    pub update_frequency_ms: Option<u64>,
    pub control_phase: Option<Vec<Phase>>,
}

impl ChargeController {
    pub fn options(&self) -> charge_controller::Options {
        let defaults = charge_controller::Options::default();
        charge_controller::Options {
            update_frequency: self
                .update_frequency_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.update_frequency),
            target_setpoint: self.target_setpoint.unwrap_or(defaults.target_setpoint),
            charge_limits: self.charge_limits.clone().unwrap_or(defaults.charge_limits),
            discharge_limits: self
                .discharge_limits
                .clone()
                .unwrap_or(defaults.discharge_limits),
            control_phase: self.control_phase.clone().unwrap_or(defaults.control_phase),
        }
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow::anyhow!("failed to read {file}: {err}"))?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn loglevel(&self) -> &str {
        &self.loglevel
    }

    pub fn meter(&self, name: &str) -> Option<&Meter> {
        self.meters.iter().find(|meter| meter.name() == name)
    }

    fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for meter in &self.meters {
            if !names.insert(meter.name()) {
                bail!("duplicate meter name {:?}", meter.name());
            }
        }

        if let Some(cc) = &self.charge_controller {
            for name in [
                &cc.grid_meter_name,
                &cc.battery_meter_name,
                &cc.battery_controller_name,
            ] {
                if self.meter(name).is_none() {
                    bail!("charge_controller references unknown meter {name:?}");
                }
            }
        }

        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
loglevel: debug
meters:
  - type: janitza
    name: hak
    host: 10.100.6.27
    port: 502
    unit: 2
  - type: janitza
    name: battery
    host: 10.100.6.229
    port: 8899
    unit: 1
    interval_ms: 250
  - type: seplos
    name: bms0
    host: 10.100.6.42
    port: 5022
  - type: victron
    name: multiplus
    id: abc123
    mqtt_host: 10.100.6.134
charge_controller:
  grid_meter_name: hak
  battery_meter_name: battery
  battery_controller_name: multiplus
  charge_limits:
    0: 3000
    90: 1000
    97: 500
  discharge_limits:
    5: 0
    10: 1000
    100: 2000
  control_phase: [l1]
"#;

    #[test]
    fn parses_the_example_config() {
        let config = Config::from_str(EXAMPLE).unwrap();
        assert_eq!(config.loglevel(), "debug");
        assert_eq!(config.meters.len(), 4);

        let Some(Meter::Janitza(battery)) = config.meter("battery") else {
            panic!("battery meter missing");
        };
        assert_eq!(battery.interval(), Duration::from_millis(250));

        let cc = config.charge_controller.as_ref().unwrap();
        let options = cc.options();
        assert_eq!(options.control_phase, vec![Phase::L1]);
        assert_eq!(options.charge_limits[&97], 500.0);
        assert_eq!(options.update_frequency, Duration::from_millis(200));
    }

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let config = Config::from_str(
            r#"
meters:
  - type: seplos
    name: bms0
    host: localhost
    port: 5022
"#,
        )
        .unwrap();
        assert_eq!(config.loglevel(), "info");

        let Some(Meter::Seplos(seplos)) = config.meter("bms0") else {
            panic!("seplos meter missing");
        };
        assert_eq!(seplos.address(), 0);
        assert_eq!(seplos.interval(), Duration::from_millis(500));
    }

    #[test]
    fn duplicate_meter_names_are_rejected() {
        let result = Config::from_str(
            r#"
meters:
  - type: seplos
    name: bms0
    host: a
    port: 1
  - type: seplos
    name: bms0
    host: b
    port: 2
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn controller_references_must_resolve() {
        let result = Config::from_str(
            r#"
meters: []
charge_controller:
  grid_meter_name: nope
  battery_meter_name: nope
  battery_controller_name: nope
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();
        let config = Config::new(file.path().to_string_lossy().into_owned()).unwrap();
        assert_eq!(config.meters.len(), 4);
    }
}
