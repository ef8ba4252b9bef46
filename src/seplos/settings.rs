use crate::prelude::*;

// Integer parameter table for the settings (0x47) response: field order on
// the wire, byte widths, scale factors and presentation units. Values are
// unsigned big-endian.
struct IntPara {
    name: &'static str,
    byte_num: usize,
    scale: f64,
    unit: &'static str,
    device_class: &'static str,
    kelvin: bool,
}

struct BitPara {
    name: &'static str,
    byte_index: usize,
    bit_index: u8,
}

const fn para(
    name: &'static str,
    byte_num: usize,
    scale: f64,
    unit: &'static str,
    device_class: &'static str,
) -> IntPara {
    IntPara { name, byte_num, scale, unit, device_class, kelvin: false }
}

const fn temp_para(name: &'static str, byte_num: usize, scale: f64) -> IntPara {
    IntPara { name, byte_num, scale, unit: "°C", device_class: "temperature", kelvin: true }
}

const INT_PARAS: &[IntPara] = &[
    para("monomer_high_voltage_alarm", 2, 0.001, "V", "voltage"),
    para("monomer_high_voltage_recovery", 2, 0.001, "V", "voltage"),
    para("monomer_low_voltage_alarm", 2, 0.001, "V", "voltage"),
    para("monomer_low_voltage_recovery", 2, 0.001, "V", "voltage"),
    para("monomer_overvoltage_protection", 2, 0.001, "V", "voltage"),
    para("monomer_overvoltage_recovery", 2, 0.001, "V", "voltage"),
    para("monomer_undervoltage_protection", 2, 0.001, "V", "voltage"),
    para("monomer_undervoltage_recovery", 2, 0.001, "V", "voltage"),
    para("equalization_opening_voltage", 2, 0.001, "V", "voltage"),
    para("battery_low_voltage_forbidden_charging", 2, 0.001, "V", "voltage"),
    para("total_voltage_high_voltage_alarm", 2, 0.01, "V", "voltage"),
    para("total_voltage_high_voltage_recovery", 2, 0.01, "V", "voltage"),
    para("total_voltage_low_voltage_alarm", 2, 0.01, "V", "voltage"),
    para("total_voltage_low_voltage_recovery", 2, 0.01, "V", "voltage"),
    para("total_voltage_overvoltage_protection", 2, 0.01, "V", "voltage"),
    para("total_voltage_overvoltage_recovery", 2, 0.01, "V", "voltage"),
    para("total_voltage_undervoltage_protection", 2, 0.01, "V", "voltage"),
    para("total_voltage_undervoltage_recovery", 2, 0.01, "V", "voltage"),
    temp_para("charging_high_temperature_alarm", 2, 0.1),
    temp_para("charging_high_temperature_recovery", 2, 0.1),
    temp_para("charging_low_temperature_alarm", 2, 0.1),
    temp_para("charging_low_temperature_recovery", 2, 0.1),
    para("charging_overcurrent_alarm", 2, 0.01, "A", "current"),
    para("charging_overcurrent_recovery", 2, 0.01, "A", "current"),
    para("discharging_overcurrent_alarm", 2, 0.01, "A", "current"),
    para("discharging_overcurrent_recovery", 2, 0.01, "A", "current"),
    para("battery_rated_capacity", 2, 0.01, "Ah", "energy"),
    para("cell_equalization_opening_difference", 2, 0.001, "V", "voltage"),
];

const BIT_PARAS: &[BitPara] = &[
    BitPara { name: "monomer_overvoltage_switch", byte_index: 0, bit_index: 0 },
    BitPara { name: "monomer_undervoltage_switch", byte_index: 0, bit_index: 1 },
    BitPara { name: "total_voltage_overvoltage_switch", byte_index: 0, bit_index: 2 },
    BitPara { name: "total_voltage_undervoltage_switch", byte_index: 0, bit_index: 3 },
    BitPara { name: "charging_overcurrent_switch", byte_index: 0, bit_index: 4 },
    BitPara { name: "discharging_overcurrent_switch", byte_index: 0, bit_index: 5 },
    BitPara { name: "temperature_protection_switch", byte_index: 0, bit_index: 6 },
    BitPara { name: "buzzer_alarm_switch", byte_index: 0, bit_index: 7 },
];

fn value_metric(bms: &str, para: &IntPara, value: f64) -> Metric {
    let definition = Arc::new(Definition::new(
        format!("seplos_settings_value_{}", para.name),
        para.unit,
        ValueKind::Instantaneous,
        para.device_class,
        Route::None,
    ));
    Metric::now(definition, value)
        .with_label("bms", bms)
        .with_label("unit", para.unit)
}

fn switch_metric(bms: &str, name: &str, value: f64) -> Metric {
    let definition = Arc::new(Definition::new(
        format!("seplos_settings_switch_{name}"),
        "-",
        ValueKind::Instantaneous,
        "-",
        Route::None,
    ));
    Metric::now(definition, value).with_label("bms", bms)
}

/// Decode one settings response against the parameter tables: sequential
/// scaled integer parameters, then the protection-switch bit field.
pub fn process(bms: &str, registry: &Registry, info: &[u8]) -> Result<(), Error> {
    let mut offset = 2usize; // data flag + command group

    for para in INT_PARAS {
        let end = offset + para.byte_num;
        let bytes = info.get(offset..end).ok_or_else(|| {
            Error::Protocol(format!(
                "settings payload too short for {}: need {end} bytes, have {}",
                para.name,
                info.len()
            ))
        })?;

        let mut raw = 0u32;
        for byte in bytes {
            raw = (raw << 8) | u32::from(*byte);
        }

        // TODO: confirm the kelvin offset sign against a live pack; the
        // upstream decoder adds it here but subtracts it in telemetry
        let value = if para.kelvin {
            (raw as f64 + 2731.0) * para.scale
        } else {
            raw as f64 * para.scale
        };

        registry.update(value_metric(bms, para, value));
        offset = end;
    }

    offset += 2; // reserved
    for para in BIT_PARAS {
        let byte = info.get(offset + para.byte_index).copied().ok_or_else(|| {
            Error::Protocol(format!(
                "settings payload too short for switch {}",
                para.name
            ))
        })?;
        let bit = (byte >> para.bit_index) & 0x1;
        registry.update(switch_metric(bms, para.name, f64::from(bit)));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_info() -> Vec<u8> {
        let mut info = vec![0x00, 0x00];
        for para in INT_PARAS {
            let raw: u16 = match para.name {
                "monomer_high_voltage_alarm" => 3550, // 3.550 V
                "charging_high_temperature_alarm" => 600, // (600 + 2731) * 0.1
                _ => 0,
            };
            info.extend_from_slice(&raw.to_be_bytes());
        }
        info.extend_from_slice(&[0x00, 0x00]); // reserved
        info.push(0b0000_0101); // switches
        info
    }

    #[test]
    fn decodes_values_and_switches() {
        let registry = Registry::new();
        process("bms0", &registry, &sample_info()).unwrap();

        let alarm = registry
            .get("seplos_settings_value_monomer_high_voltage_alarm{bms=\"bms0\",unit=\"V\"}")
            .unwrap();
        assert!((alarm.value() - 3.550).abs() < 1e-9);

        let temp = registry
            .get("seplos_settings_value_charging_high_temperature_alarm{bms=\"bms0\",unit=\"°C\"}")
            .unwrap();
        assert!((temp.value() - 333.1).abs() < 1e-9);

        let on = registry
            .get("seplos_settings_switch_total_voltage_overvoltage_switch{bms=\"bms0\"}")
            .unwrap();
        assert_eq!(on.value(), 1.0);
        let off = registry
            .get("seplos_settings_switch_monomer_undervoltage_switch{bms=\"bms0\"}")
            .unwrap();
        assert_eq!(off.value(), 0.0);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let registry = Registry::new();
        let mut info = sample_info();
        info.truncate(6);
        assert!(matches!(
            process("bms0", &registry, &info),
            Err(Error::Protocol(_))
        ));
    }
}
