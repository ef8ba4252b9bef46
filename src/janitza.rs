use crate::meter::{has_label, phase_label, MeterClassifier, Phase};
use crate::prelude::*;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::Slave;

// Register order is mandatory: the whole block is fetched with one bulk read
// and decoded positionally.
static REGISTERS: Lazy<Vec<Arc<Definition>>> = Lazy::new(|| {
    [
        //  metric                              unit  class             route (VE topic)
        ("voltage;phase=l1",                    "V",  "voltage",        "Ac/L1/Voltage"),
        ("voltage;phase=l2",                    "V",  "voltage",        "Ac/L2/Voltage"),
        ("voltage;phase=l3",                    "V",  "voltage",        "Ac/L3/Voltage"),
        ("voltage;phase=l1_l2",                 "V",  "voltage",        "-Ac/L1-L2/Voltage"),
        ("voltage;phase=l2_l3",                 "V",  "voltage",        "-Ac/L2-L3/Voltage"),
        ("voltage;phase=l1_l3",                 "V",  "voltage",        "-Ac/L1-L3/Voltage"),
        ("current;phase=l1",                    "A",  "current",        "Ac/L1/Current"),
        ("current;phase=l2",                    "A",  "current",        "Ac/L2/Current"),
        ("current;phase=l3",                    "A",  "current",        "Ac/L3/Current"),
        ("current_total",                       "A",  "current",        "Ac/Current"),
        ("real_power;phase=l1",                 "W",  "power",          "Ac/L1/Power"),
        ("real_power;phase=l2",                 "W",  "power",          "Ac/L2/Power"),
        ("real_power;phase=l3",                 "W",  "power",          "Ac/L3/Power"),
        ("real_power_total",                    "W",  "power",          "Ac/Power"),
        ("apparent_power;phase=l1",             "VA", "apparent_power", "-Ac/L1/ApparentPower"),
        ("apparent_power;phase=l2",             "VA", "apparent_power", "-Ac/L2/ApparentPower"),
        ("apparent_power;phase=l3",             "VA", "apparent_power", "-Ac/L3/ApparentPower"),
        ("apparent_power_total",                "VA", "apparent_power", "-Ac/ApparentPower"),
        ("reactive_power;phase=l1",             "var", "reactive_power", "-Ac/L1/ReactivePower"),
        ("reactive_power;phase=l2",             "var", "reactive_power", "-Ac/L2/ReactivePower"),
        ("reactive_power;phase=l3",             "var", "reactive_power", "-Ac/L3/ReactivePower"),
        ("reactive_power_total",                "var", "reactive_power", "-Ac/ReactivePower"),
        ("power_factor;phase=l1",               "-",  "power_factor",   "-Ac/L1/PowerFactor"),
        ("power_factor;phase=l2",               "-",  "power_factor",   "-Ac/L2/PowerFactor"),
        ("power_factor;phase=l3",               "-",  "power_factor",   "-Ac/L3/PowerFactor"),
        ("frequency",                           "Hz", "frequency",      "Ac/Frequency"),
        ("rotation_field",                      "-",  "-",              "-"),
        ("real_energy_l1_total",                "Wh", "energy",         "-Ac/L1/Energy"),
        ("real_energy_l2_total",                "Wh", "energy",         "-Ac/L2/Energy"),
        ("real_energy_l3_total",                "Wh", "energy",         "-Ac/L3/Energy"),
        ("real_energy_total",                   "Wh", "energy",         "-Ac/Energy"),
        ("real_energy_l1_consumed_total",       "Wh", "energy",         "Ac/L1/Energy/Reverse"),
        ("real_energy_l2_consumed_total",       "Wh", "energy",         "Ac/L2/Energy/Reverse"),
        ("real_energy_l3_consumed_total",       "Wh", "energy",         "Ac/L3/Energy/Reverse"),
        ("real_energy_consumed_total",          "Wh", "energy",         "Ac/Energy/Reverse"),
        ("real_energy_l1_delivered_total",      "Wh", "energy",         "Ac/L1/Energy/Forward"),
        ("real_energy_l2_delivered_total",      "Wh", "energy",         "Ac/L2/Energy/Forward"),
        ("real_energy_l3_delivered_total",      "Wh", "energy",         "Ac/L3/Energy/Forward"),
        ("real_energy_delivered_total",         "Wh", "energy",         "Ac/Energy/Forward"),
    ]
    .iter()
    .map(|(metric, unit, class, route)| {
        let kind = if metric.ends_with("_total") && unit == &"Wh" {
            ValueKind::MonotonicIncreasing
        } else {
            ValueKind::Instantaneous
        };
        let route = match *route {
            "-" => Route::None,
            topic => Route::Topic(topic.to_string()),
        };
        Arc::new(Definition::new(format!("janitza_{metric}"), *unit, kind, *class, route))
    })
    .collect()
});

static METRICS: Lazy<HashMap<&'static str, Arc<Definition>>> = Lazy::new(|| {
    [
        ("collecting_registers_seconds_total", "s"),
        ("processing_registers_seconds_total", "s"),
        ("processing_registers_count_total", "-"),
        ("processing_reconnect_count_total", "-"),
        ("processing_errors_count_total", "-"),
        ("collecting_registers_pressure_count_total", "-"),
    ]
    .iter()
    .map(|(metric, unit)| {
        (
            *metric,
            Arc::new(Definition::new(
                format!("janitza_{metric}"),
                *unit,
                ValueKind::MonotonicIncreasing,
                "-",
                Route::None,
            )),
        )
    })
    .collect()
});

// Janitza meters refresh their registers roughly every 200ms; polling at
// 100ms keeps the power readings at most one device cycle late.
pub const INTERVAL: Duration = Duration::from_millis(100);

const REGISTER_BASE: u16 = 19000;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CONSECUTIVE_ERROR_LIMIT: u32 = 5;

/// Periodic bulk poller for a Janitza-class power analyser over Modbus/TCP.
/// Owns its connection exclusively and writes every decoded register into the
/// registry with one shared cycle timestamp.
pub struct Janitza {
    name: String,
    host: String,
    port: u16,
    unit: u8,
    interval: Duration,
    registry: Arc<Registry>,
}

impl Janitza {
    pub fn new(registry: Arc<Registry>, config: &config::Janitza) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port(),
            unit: config.unit(),
            interval: config.interval(),
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Supervised poll loop: any error that escapes a cycle tears the
    /// connection down and rebuilds it after a fixed delay. Never returns in
    /// steady state.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        loop {
            if let Err(err) = self.run().await {
                error!("{}: caught error: {err:#}, resetting connection", self.name);
                self.increment("processing_reconnect_count_total", 1.0);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    async fn run(self: &Arc<Self>) -> Result<()> {
        let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}", self.host))?;

        let mut ctx = tcp::connect_slave(addr, Slave(self.unit)).await?;
        info!("{}: connected to {}:{}", self.name, self.host, self.port);

        let mut error_counter = 0u32;
        loop {
            let started_at = Instant::now();

            let response = match tokio::time::timeout(
                READ_TIMEOUT,
                self.query_registers(&mut ctx),
            )
            .await
            {
                Err(_elapsed) => {
                    self.count_error("modbus_timeout");
                    self.sleep_max(started_at.elapsed()).await;
                    continue;
                }
                Ok(Err(err)) => {
                    error_counter += 1;
                    self.count_error("unknown_error");
                    error!("{}: modbus processing error: {err:#}", self.name);
                    if error_counter > CONSECUTIVE_ERROR_LIMIT {
                        return Err(err);
                    }
                    self.sleep_max(started_at.elapsed()).await;
                    continue;
                }
                Ok(Ok(Err(exception))) => {
                    self.count_error("modbus_exception");
                    debug!("{}: modbus exception: {exception}", self.name);
                    self.sleep_max(started_at.elapsed()).await;
                    continue;
                }
                Ok(Ok(Ok(words))) => words,
            };

            if response.is_empty() {
                self.count_error("register_query_error");
                self.sleep_max(started_at.elapsed()).await;
                continue;
            }

            let collected = started_at.elapsed();
            let timestamp = Utc::now();
            self.increment("collecting_registers_seconds_total", collected.as_secs_f64());

            if self.process_cycle(&response, timestamp) > 0 {
                self.increment(
                    "processing_registers_seconds_total",
                    started_at.elapsed().as_secs_f64(),
                );
                error_counter = 0;
            }
            self.sleep_max(started_at.elapsed()).await;
        }
    }

    async fn query_registers(
        &self,
        ctx: &mut Context,
    ) -> Result<std::result::Result<Vec<u16>, tokio_modbus::Exception>> {
        let quantity = (REGISTERS.len() * 2) as u16;
        Ok(ctx.read_holding_registers(REGISTER_BASE, quantity).await?)
    }

    /// Decode one bulk response and upsert every value with the shared cycle
    /// timestamp. A length mismatch discards the whole cycle; no partial
    /// decode is attempted.
    fn process_cycle(self: &Arc<Self>, words: &[u16], timestamp: DateTime<Utc>) -> usize {
        let values = Self::decode_registers(words);

        if values.len() != REGISTERS.len() {
            // seen in the wild on waveshare gateways
            self.count_error("register_overrun");
            return 0;
        }

        for (definition, value) in REGISTERS.iter().zip(&values) {
            match Metric::new(definition.clone(), *value as f64, timestamp) {
                Ok(metric) => self.registry.update(
                    metric
                        .with_label("name", &self.name)
                        .with_origin(self.origin()),
                ),
                Err(err) => warn!("{}: skipping register: {err}", self.name),
            }
        }

        self.increment("processing_registers_count_total", values.len() as f64);

        values.len()
    }

    /// Registers hold big-endian 32-bit floats, one per register pair, in
    /// schema order.
    fn decode_registers(words: &[u16]) -> Vec<f32> {
        words
            .chunks_exact(2)
            .map(|pair| f32::from_bits(((pair[0] as u32) << 16) | pair[1] as u32))
            .collect()
    }

    /// Sleep out the remainder of the poll interval. An overrunning cycle
    /// starts the next one immediately and bumps the pressure counter instead
    /// of skipping data collection.
    async fn sleep_max(self: &Arc<Self>, elapsed: Duration) {
        if elapsed > self.interval {
            self.increment("collecting_registers_pressure_count_total", 1.0);
            return;
        }

        tokio::time::sleep(self.interval - elapsed).await;
    }

    fn counter(self: &Arc<Self>, key: &str) -> Metric {
        let definition = METRICS
            .get(key)
            .unwrap_or_else(|| panic!("unknown janitza counter {key:?}"))
            .clone();
        Metric::now(definition, 0.0)
            .with_label("name", &self.name)
            .with_origin(self.origin())
    }

    fn increment(self: &Arc<Self>, key: &str, delta: f64) {
        if let Err(err) = self.registry.increment(self.counter(key), delta) {
            warn!("{}: failed to increment {key}: {err}", self.name);
        }
    }

    fn count_error(self: &Arc<Self>, kind: &str) {
        let metric = self
            .counter("processing_errors_count_total")
            .with_label("error", kind);
        if let Err(err) = self.registry.increment(metric, 1.0) {
            warn!("{}: failed to count error {kind}: {err}", self.name);
        }
    }

    fn origin(self: &Arc<Self>) -> crate::metric::Origin {
        let this: Arc<dyn MeterClassifier> = self.clone();
        Arc::downgrade(&this)
    }
}

impl MeterClassifier for Janitza {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn power_metric_classifier(&self, fingerprint: &str) -> Option<Phase> {
        if fingerprint.contains("real_power") && has_label(fingerprint, "name", &self.name) {
            phase_label(fingerprint)
        } else {
            None
        }
    }

    fn total_power_metric_classifier(&self, fingerprint: &str) -> bool {
        fingerprint.contains("real_power_total") && has_label(fingerprint, "name", &self.name)
    }
}
