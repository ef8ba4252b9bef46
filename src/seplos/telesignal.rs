use crate::prelude::*;

// Protocol description table for the telesignal (0x44) response: named warn
// bytes per group, then event flags addressed by byte/bit offset, then the
// power-mode byte matched by value. The upstream firmware documents exactly
// six temperature sensors.
pub const TEMP_SENSOR_COUNT: u8 = 6;

struct GbSignal {
    name: &'static str,
    kind: &'static str,
}

struct BitSignal {
    name: &'static str,
    kind: &'static str,
    byte_index: usize,
    bit_index: u8,
}

struct ModeText {
    name: &'static str,
    byte_index: usize,
    value: u8,
}

const TEMP_SIGNALS: &[GbSignal] = &[
    GbSignal { name: "temperature_warn_cell_group_1", kind: "warn" },
    GbSignal { name: "temperature_warn_cell_group_2", kind: "warn" },
    GbSignal { name: "temperature_warn_cell_group_3", kind: "warn" },
    GbSignal { name: "temperature_warn_cell_group_4", kind: "warn" },
    GbSignal { name: "temperature_warn_ambient", kind: "warn" },
    GbSignal { name: "temperature_warn_power", kind: "warn" },
];

const CHARGE_SIGNALS: &[GbSignal] = &[
    GbSignal { name: "charge_current_warn", kind: "warn" },
    GbSignal { name: "total_battery_voltage_warn", kind: "warn" },
    GbSignal { name: "discharge_current_warn", kind: "warn" },
];

const EXT_SIGNALS: &[BitSignal] = &[
    BitSignal { name: "voltage_sensor_fault", kind: "alarm", byte_index: 0, bit_index: 0 },
    BitSignal { name: "temperature_sensor_fault", kind: "alarm", byte_index: 0, bit_index: 1 },
    BitSignal { name: "current_sensor_fault", kind: "alarm", byte_index: 0, bit_index: 2 },
    BitSignal { name: "key_switch_fault", kind: "alarm", byte_index: 0, bit_index: 3 },
    BitSignal { name: "cell_voltage_difference_fault", kind: "alarm", byte_index: 0, bit_index: 4 },
    BitSignal { name: "charging_switch_fault", kind: "alarm", byte_index: 0, bit_index: 5 },
    BitSignal { name: "discharging_switch_fault", kind: "alarm", byte_index: 0, bit_index: 6 },
    BitSignal { name: "current_limit_switch_fault", kind: "alarm", byte_index: 0, bit_index: 7 },
    BitSignal { name: "monomer_overvoltage_alarm", kind: "alarm", byte_index: 1, bit_index: 0 },
    BitSignal { name: "monomer_undervoltage_alarm", kind: "alarm", byte_index: 1, bit_index: 1 },
    BitSignal { name: "total_voltage_overvoltage_alarm", kind: "alarm", byte_index: 1, bit_index: 2 },
    BitSignal { name: "total_voltage_undervoltage_alarm", kind: "alarm", byte_index: 1, bit_index: 3 },
    BitSignal { name: "charging_overcurrent_alarm", kind: "alarm", byte_index: 1, bit_index: 4 },
    BitSignal { name: "discharging_overcurrent_alarm", kind: "alarm", byte_index: 1, bit_index: 5 },
    BitSignal { name: "cell_temperature_high_alarm", kind: "alarm", byte_index: 1, bit_index: 6 },
    BitSignal { name: "environment_temperature_high_alarm", kind: "alarm", byte_index: 1, bit_index: 7 },
    BitSignal { name: "discharge_switch", kind: "switch", byte_index: 2, bit_index: 0 },
    BitSignal { name: "charge_switch", kind: "switch", byte_index: 2, bit_index: 1 },
    BitSignal { name: "current_limit_switch", kind: "switch", byte_index: 2, bit_index: 2 },
    BitSignal { name: "heating_switch", kind: "switch", byte_index: 2, bit_index: 3 },
];

const MODE_TEXTS: &[ModeText] = &[
    ModeText { name: "system_power_status_standby", byte_index: 3, value: 0x00 },
    ModeText { name: "system_power_status_discharge", byte_index: 3, value: 0x01 },
    ModeText { name: "system_power_status_charge", byte_index: 3, value: 0x02 },
    ModeText { name: "system_power_status_floating_charge", byte_index: 3, value: 0x04 },
    ModeText { name: "system_power_status_full_charge", byte_index: 3, value: 0x08 },
];

fn m(bms: &str, name: &str, value: f64) -> Metric {
    let definition = Arc::new(Definition::new(
        format!("seplos_telesignal_{name}"),
        "-",
        ValueKind::Instantaneous,
        "-",
        Route::None,
    ));
    Metric::now(definition, value).with_label("bms", bms)
}

fn bool_value(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn byte_at(info: &[u8], index: usize) -> Result<u8, Error> {
    info.get(index).copied().ok_or_else(|| {
        Error::Protocol(format!(
            "telesignal payload too short: no byte at offset {index}"
        ))
    })
}

/// Decode one telesignal response: per-cell voltage warn bytes, named group
/// warn bytes, bit-table event flags and the power-mode byte.
pub fn process(bms: &str, registry: &Registry, info: &[u8]) -> Result<(), Error> {
    let mut offset = 2usize; // data flag + command group

    let cell_count = byte_at(info, offset)? as usize;
    offset += 1;
    for i in 0..cell_count {
        let byte = byte_at(info, offset)?;
        registry.update(m(bms, &format!("voltage_warn_cell_{}", i + 1), byte as f64));
        offset += 1;
    }

    let sensor_count = byte_at(info, offset)?;
    if sensor_count != TEMP_SENSOR_COUNT {
        return Err(Error::Protocol(format!(
            "temp sensors should equal {TEMP_SENSOR_COUNT}, got {sensor_count}"
        )));
    }
    offset += 1;

    for signal in TEMP_SIGNALS.iter().chain(CHARGE_SIGNALS) {
        let byte = byte_at(info, offset)?;
        registry.update(m(bms, signal.name, byte as f64).with_label("type", signal.kind));
        offset += 1;
    }

    offset += 1; // custom signal count
    for signal in EXT_SIGNALS {
        let byte = byte_at(info, offset + signal.byte_index)?;
        let flag = byte & (1 << signal.bit_index) != 0;
        registry.update(m(bms, signal.name, bool_value(flag)).with_label("type", signal.kind));
    }

    for mode in MODE_TEXTS {
        let byte = byte_at(info, offset + mode.byte_index)?;
        registry.update(m(bms, mode.name, bool_value(byte == mode.value)));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_info() -> Vec<u8> {
        let mut info = vec![0x00, 0x00];
        info.push(2); // cells
        info.extend_from_slice(&[0x00, 0x01]); // cell warn bytes
        info.push(TEMP_SENSOR_COUNT);
        info.extend_from_slice(&[0, 0, 0, 0, 1, 0]); // temp group warns
        info.extend_from_slice(&[0, 0, 0]); // charge group warns
        info.push(0); // custom signal count
        info.extend_from_slice(&[0b0000_0100, 0b0000_0010, 0b0000_0011, 0x02]);
        info
    }

    #[test]
    fn decodes_warn_bytes_and_flags() {
        let registry = Registry::new();
        process("bms0", &registry, &sample_info()).unwrap();

        let warn = registry
            .get("seplos_telesignal_voltage_warn_cell_2{bms=\"bms0\"}")
            .unwrap();
        assert_eq!(warn.value(), 1.0);

        let ambient = registry
            .get("seplos_telesignal_temperature_warn_ambient{bms=\"bms0\",type=\"warn\"}")
            .unwrap();
        assert_eq!(ambient.value(), 1.0);

        let fault = registry
            .get("seplos_telesignal_current_sensor_fault{bms=\"bms0\",type=\"alarm\"}")
            .unwrap();
        assert_eq!(fault.value(), 1.0);

        let charging = registry
            .get("seplos_telesignal_charge_switch{bms=\"bms0\",type=\"switch\"}")
            .unwrap();
        assert_eq!(charging.value(), 1.0);

        let mode = registry
            .get("seplos_telesignal_system_power_status_charge{bms=\"bms0\"}")
            .unwrap();
        assert_eq!(mode.value(), 1.0);
        let standby = registry
            .get("seplos_telesignal_system_power_status_standby{bms=\"bms0\"}")
            .unwrap();
        assert_eq!(standby.value(), 0.0);
    }

    #[test]
    fn unexpected_sensor_count_is_rejected() {
        let registry = Registry::new();
        let mut info = sample_info();
        info[5] = 4; // sensor count sits after the two cell warn bytes
        assert!(matches!(
            process("bms0", &registry, &info),
            Err(Error::Protocol(message)) if message.contains("temp sensors")
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let registry = Registry::new();
        let mut info = sample_info();
        info.truncate(9);
        assert!(process("bms0", &registry, &info).is_err());
    }
}
