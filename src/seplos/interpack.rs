use crate::prelude::*;
use crate::utils::Utils;

use nom_derive::{Nom, Parse};
use once_cell::sync::Lazy;
use std::collections::HashMap;

static REGISTERS: Lazy<HashMap<&'static str, Arc<Definition>>> = Lazy::new(|| {
    [
        ("cell_highest", "V", "voltage"),
        ("cell_lowest", "V", "voltage"),
        ("temperature_highest", "°C", "temperature"),
        ("temperature_lowest", "°C", "temperature"),
        ("current", "A", "current"),
        ("pack_voltage", "V", "voltage"),
        ("residual_capacity", "Ah", "energy"),
        ("battery_capacity", "Ah", "energy"),
        ("soc", "%", "battery"),
        ("port_voltage", "V", "voltage"),
    ]
    .iter()
    .map(|(metric, unit, class)| {
        (
            *metric,
            Arc::new(Definition::new(
                format!("seplos_interpack_{metric}"),
                *unit,
                ValueKind::Instantaneous,
                *class,
                Route::None,
            )),
        )
    })
    .collect()
});

/// Summary frame a pack master forwards for each member of a clustered
/// install; fixed-width big-endian fields after the two leading bytes.
#[derive(Clone, Debug, PartialEq, Nom)]
#[nom(BigEndian)]
pub struct InterpackData {
    #[nom(Parse = "Utils::be_u16_div10")]
    pub cell_highest: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    pub cell_lowest: f64,
    #[nom(Parse = "Utils::be_u16_offset_deci_kelvin")]
    pub temperature_highest: f64,
    #[nom(Parse = "Utils::be_u16_offset_deci_kelvin")]
    pub temperature_lowest: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    pub current: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    pub pack_voltage: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    pub residual_capacity: f64,
    #[nom(Parse = "Utils::be_u16_div100")]
    pub battery_capacity: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    pub soc: f64,
    #[nom(Parse = "Utils::be_u16_div10")]
    pub port_voltage: f64,
}

pub fn decode(info: &[u8]) -> Result<InterpackData, Error> {
    if info.len() < 2 {
        return Err(Error::Protocol(format!(
            "inter-pack payload too short: {} bytes",
            info.len()
        )));
    }

    let (_, data) = InterpackData::parse(&info[2..])
        .map_err(|err| Error::Protocol(format!("inter-pack payload decode failed: {err:?}")))?;
    Ok(data)
}

pub fn process(bms: &str, registry: &Registry, info: &[u8]) -> Result<(), Error> {
    let data = decode(info)?;
    let m = |name: &str, value: f64| {
        Metric::now(REGISTERS[name].clone(), value).with_label("bms", bms)
    };

    registry.update(m("cell_highest", data.cell_highest));
    registry.update(m("cell_lowest", data.cell_lowest));
    registry.update(m("temperature_highest", data.temperature_highest));
    registry.update(m("temperature_lowest", data.temperature_lowest));
    registry.update(m("current", data.current));
    registry.update(m("pack_voltage", data.pack_voltage));
    registry.update(m("residual_capacity", data.residual_capacity));
    registry.update(m("battery_capacity", data.battery_capacity));
    registry.update(m("soc", data.soc));
    registry.update(m("port_voltage", data.port_voltage));

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_info() -> Vec<u8> {
        let mut info = vec![0x00, 0x00];
        for raw in [33u16, 32, 300, 280, 150, 5230, 4750, 5000, 955, 524] {
            info.extend_from_slice(&raw.to_be_bytes());
        }
        info
    }

    #[test]
    fn decodes_the_sample_payload() {
        let data = decode(&sample_info()).unwrap();
        assert_eq!(data.cell_highest, 3.3);
        assert_eq!(data.current, 1.5);
        assert_eq!(data.pack_voltage, 52.3);
        assert_eq!(data.soc, 95.5);
        assert!((data.temperature_highest - 303.1).abs() < 1e-9);
    }

    #[test]
    fn process_publishes_pack_metrics() {
        let registry = Registry::new();
        process("bms0", &registry, &sample_info()).unwrap();

        let soc = registry.get("seplos_interpack_soc{bms=\"bms0\"}").unwrap();
        assert_eq!(soc.value(), 95.5);
    }
}
