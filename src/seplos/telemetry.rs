use crate::prelude::*;
use crate::utils::Utils;

use nom_derive::{Nom, Parse};
use once_cell::sync::Lazy;
use std::collections::HashMap;

static REGISTERS: Lazy<HashMap<&'static str, Arc<Definition>>> = Lazy::new(|| {
    [
        //  metric                    unit  kind                            class
        ("charge_rate",              "A",  ValueKind::Instantaneous,       "current"),
        ("total_battery_voltage",    "V",  ValueKind::Instantaneous,       "voltage"),
        ("residual_capacity",        "Ah", ValueKind::Instantaneous,       "energy"),
        ("battery_capacity",         "Ah", ValueKind::Instantaneous,       "energy"),
        ("rated_capacity",           "Ah", ValueKind::Instantaneous,       "energy"),
        ("port_voltage",             "V",  ValueKind::Instantaneous,       "voltage"),
        ("soc",                      "%",  ValueKind::Instantaneous,       "battery"),
        ("soh",                      "%",  ValueKind::Instantaneous,       "battery"),
        ("cycles_count_total",       "-",  ValueKind::MonotonicIncreasing, "-"),
        ("cell_voltage",             "V",  ValueKind::Instantaneous,       "voltage"),
        ("temperature_celsius",      "°C", ValueKind::Instantaneous,       "temperature"),
    ]
    .iter()
    .map(|(metric, unit, kind, class)| {
        (
            *metric,
            Arc::new(Definition::new(
                format!("seplos_telemetry_{metric}"),
                *unit,
                *kind,
                *class,
                Route::None,
            )),
        )
    })
    .collect()
});

/// Telemetry payload, after the two leading data-flag/group bytes. Cell and
/// temperature arrays carry their own element counts; scalar fields are
/// fixed-width big-endian with per-field scale factors and two's-complement
/// sign interpretation.
#[derive(Clone, Debug, PartialEq, Nom)]
#[nom(BigEndian)]
pub struct TelemetryData {
    pub cell_count: u8,
    #[nom(Count = "cell_count as usize")]
    cell_voltages_raw: Vec<u16>,
    pub temperature_count: u8,
    #[nom(Count = "temperature_count as usize")]
    temperatures_raw: Vec<u16>,
    #[nom(Parse = "Utils::be_i16_div100")]
    pub charge_rate: f64,
    #[nom(Parse = "Utils::be_i16_div100")]
    pub total_battery_voltage: f64,
    #[nom(Parse = "Utils::be_i16_div100")]
    pub residual_capacity: f64,
    #[nom(SkipBefore(1))] // custom field count
    #[nom(Parse = "Utils::be_i16_div100")]
    pub battery_capacity: f64,
    #[nom(Parse = "Utils::be_i16_div10")]
    pub soc: f64,
    #[nom(Parse = "Utils::be_i16_div100")]
    pub rated_capacity: f64,
    #[nom(Parse = "Utils::be_i16_f64")]
    pub cycles: f64,
    #[nom(Parse = "Utils::be_i16_div10")]
    pub soh: f64,
    #[nom(Parse = "Utils::be_i16_div100")]
    pub port_voltage: f64,
}

impl TelemetryData {
    /// Cell voltages in volts, in pack order.
    pub fn cell_voltages(&self) -> impl Iterator<Item = f64> + '_ {
        self.cell_voltages_raw.iter().map(|raw| *raw as f64 / 1000.0)
    }

    /// Sensor temperatures in °C; the device reports 0.1 K.
    pub fn temperatures(&self) -> impl Iterator<Item = f64> + '_ {
        self.temperatures_raw
            .iter()
            .map(|raw| (*raw as f64 - 2731.0) / 10.0)
    }
}

pub fn decode(info: &[u8]) -> Result<TelemetryData, Error> {
    if info.len() < 2 {
        return Err(Error::Protocol(format!(
            "telemetry payload too short: {} bytes",
            info.len()
        )));
    }

    let (_, data) = TelemetryData::parse(&info[2..])
        .map_err(|err| Error::Protocol(format!("telemetry payload decode failed: {err:?}")))?;
    Ok(data)
}

/// Decode one telemetry response and publish every reading, per-cell and
/// per-sensor values labelled with their index.
pub fn process(bms: &str, registry: &Registry, info: &[u8]) -> Result<(), Error> {
    let data = decode(info)?;
    let m = |name: &str, value: f64| {
        Metric::now(REGISTERS[name].clone(), value).with_label("bms", bms)
    };

    for (i, value) in data.cell_voltages().enumerate() {
        registry.update(m("cell_voltage", value).with_label("cell", (i + 1).to_string()));
    }
    for (i, value) in data.temperatures().enumerate() {
        registry.update(m("temperature_celsius", value).with_label("sensor", i.to_string()));
    }

    registry.update(m("charge_rate", data.charge_rate));
    registry.update(m("total_battery_voltage", data.total_battery_voltage));
    registry.update(m("residual_capacity", data.residual_capacity));
    registry.update(m("battery_capacity", data.battery_capacity));
    registry.update(m("soc", data.soc));
    registry.update(m("rated_capacity", data.rated_capacity));
    registry.update(m("cycles_count_total", data.cycles));
    registry.update(m("soh", data.soh));
    registry.update(m("port_voltage", data.port_voltage));

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // two cells, one sensor, then the scalar block
    pub(crate) fn sample_info() -> Vec<u8> {
        let mut info = vec![0x00, 0x00];
        info.push(2); // cell count
        info.extend_from_slice(&3312u16.to_be_bytes()); // 3.312 V
        info.extend_from_slice(&3308u16.to_be_bytes());
        info.push(1); // temperature count
        info.extend_from_slice(&3000u16.to_be_bytes()); // 26.9 °C
        info.extend_from_slice(&(-250i16).to_be_bytes()); // -2.5 A
        info.extend_from_slice(&5230u16.to_be_bytes()); // 52.30 V
        info.extend_from_slice(&4750u16.to_be_bytes()); // 47.50 Ah
        info.push(10); // custom field count
        info.extend_from_slice(&5000u16.to_be_bytes()); // 50.00 Ah
        info.extend_from_slice(&955u16.to_be_bytes()); // 95.5 %
        info.extend_from_slice(&5000u16.to_be_bytes()); // 50.00 Ah
        info.extend_from_slice(&42u16.to_be_bytes()); // cycles
        info.extend_from_slice(&1000u16.to_be_bytes()); // 100.0 %
        info.extend_from_slice(&5241u16.to_be_bytes()); // 52.41 V
        info
    }

    #[test]
    fn decodes_the_sample_payload() {
        let data = decode(&sample_info()).unwrap();

        assert_eq!(data.cell_count, 2);
        let cells: Vec<f64> = data.cell_voltages().collect();
        assert_eq!(cells, vec![3.312, 3.308]);
        let temps: Vec<f64> = data.temperatures().collect();
        assert_eq!(temps, vec![26.9]);
        assert_eq!(data.charge_rate, -2.5);
        assert_eq!(data.total_battery_voltage, 52.30);
        assert_eq!(data.residual_capacity, 47.50);
        assert_eq!(data.battery_capacity, 50.00);
        assert_eq!(data.soc, 95.5);
        assert_eq!(data.cycles, 42.0);
        assert_eq!(data.soh, 100.0);
        assert_eq!(data.port_voltage, 52.41);
    }

    #[test]
    fn process_publishes_labelled_metrics() {
        let registry = Registry::new();
        process("bms0", &registry, &sample_info()).unwrap();

        let cell = registry
            .get("seplos_telemetry_cell_voltage{bms=\"bms0\",cell=\"2\"}")
            .unwrap();
        assert_eq!(cell.value(), 3.308);
        let sensor = registry
            .get("seplos_telemetry_temperature_celsius{bms=\"bms0\",sensor=\"0\"}")
            .unwrap();
        assert_eq!(sensor.value(), 26.9);
        let soc = registry.get("seplos_telemetry_soc{bms=\"bms0\"}").unwrap();
        assert_eq!(soc.value(), 95.5);
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        let mut info = sample_info();
        info.truncate(10);
        assert!(matches!(decode(&info), Err(Error::Protocol(_))));
    }
}
