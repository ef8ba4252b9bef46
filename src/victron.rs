use crate::meter::{has_label, phase_label, BatteryController, MeterClassifier, Phase};
use crate::prelude::*;

use once_cell::sync::Lazy;
use regex::Regex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Publish, QoS};
use std::collections::HashMap;
use std::sync::RwLock;

// Venus OS mirrors device state under N/<id>/...; each definition's route is
// the topic it arrives on. The SOC and charge-limit values live outside the
// vebus subtree and are matched by pattern instead of suffix.
static REGISTERS: Lazy<Vec<Arc<Definition>>> = Lazy::new(|| {
    let topic = |metric: &str, unit: &str, class: &str, route: &str| {
        Arc::new(Definition::new(
            format!("victron_{metric}"),
            unit,
            ValueKind::Instantaneous,
            class,
            Route::Topic(route.to_string()),
        ))
    };
    let pattern = |metric: &str, unit: &str, class: &str, route: &str| {
        Arc::new(Definition::new(
            format!("victron_{metric}"),
            unit,
            ValueKind::Instantaneous,
            class,
            Route::Pattern(Regex::new(route).expect("static register pattern")),
        ))
    };

    vec![
        topic("ac_in_power;phase=l1", "W", "power", "Ac/ActiveIn/L1/P"),
        topic("ac_in_power;phase=l2", "W", "power", "Ac/ActiveIn/L2/P"),
        topic("ac_in_power;phase=l3", "W", "power", "Ac/ActiveIn/L3/P"),
        topic("ac_in_power_total", "W", "power", "Ac/ActiveIn/P"),
        topic("ac_in_apparent_power;phase=l1", "VA", "apparent_power", "Ac/ActiveIn/L1/S"),
        topic("ac_in_apparent_power;phase=l2", "VA", "apparent_power", "Ac/ActiveIn/L2/S"),
        topic("ac_in_apparent_power;phase=l3", "VA", "apparent_power", "Ac/ActiveIn/L3/S"),
        topic("ac_in_apparent_power_total", "VA", "apparent_power", "Ac/ActiveIn/S"),
        topic("ac_in_current;phase=l1", "A", "current", "Ac/ActiveIn/L1/I"),
        topic("ac_in_current;phase=l2", "A", "current", "Ac/ActiveIn/L2/I"),
        topic("ac_in_current;phase=l3", "A", "current", "Ac/ActiveIn/L3/I"),
        topic("ac_in_current_total", "A", "current", "Ac/ActiveIn/I"),
        topic("ac_in_voltage;phase=l1", "V", "voltage", "Ac/ActiveIn/L1/V"),
        topic("ac_in_voltage;phase=l2", "V", "voltage", "Ac/ActiveIn/L2/V"),
        topic("ac_in_voltage;phase=l3", "V", "voltage", "Ac/ActiveIn/L3/V"),
        topic("ac_out_power;phase=l1", "W", "power", "Ac/Out/L1/P"),
        topic("ac_out_power;phase=l2", "W", "power", "Ac/Out/L2/P"),
        topic("ac_out_power;phase=l3", "W", "power", "Ac/Out/L3/P"),
        topic("ac_out_power_total", "W", "power", "Ac/Out/P"),
        topic("ac_out_apparent_power;phase=l1", "VA", "apparent_power", "Ac/Out/L1/S"),
        topic("ac_out_apparent_power;phase=l2", "VA", "apparent_power", "Ac/Out/L2/S"),
        topic("ac_out_apparent_power;phase=l3", "VA", "apparent_power", "Ac/Out/L3/S"),
        topic("ac_out_apparent_power_total", "VA", "apparent_power", "Ac/Out/S"),
        topic("ac_out_current;phase=l1", "A", "current", "Ac/Out/L1/I"),
        topic("ac_out_current;phase=l2", "A", "current", "Ac/Out/L2/I"),
        topic("ac_out_current;phase=l3", "A", "current", "Ac/Out/L3/I"),
        topic("ac_out_current_total", "A", "current", "Ac/Out/I"),
        topic("ac_out_voltage;phase=l1", "V", "voltage", "Ac/Out/L1/V"),
        topic("ac_out_voltage;phase=l2", "V", "voltage", "Ac/Out/L2/V"),
        topic("ac_out_voltage;phase=l3", "V", "voltage", "Ac/Out/L3/V"),
        topic("ac_out_voltage_frequency;phase=l1", "Hz", "frequency", "Ac/Out/L1/F"),
        topic("ac_out_voltage_frequency;phase=l2", "Hz", "frequency", "Ac/Out/L2/F"),
        topic("ac_out_voltage_frequency;phase=l3", "Hz", "frequency", "Ac/Out/L3/F"),
        topic("dc_power", "W", "power", "Dc/0/Power"),
        topic("dc_current", "A", "current", "Dc/0/Current"),
        topic("dc_voltage", "V", "voltage", "Dc/0/Voltage"),
        pattern("dc_soc", "%", "battery", r"/vebus/\d+/Soc$"),
        pattern("dc_max_charge_current", "A", "current", r"/battery/\d+/Info/MaxChargeCurrent$"),
    ]
});

static METRICS: Lazy<HashMap<&'static str, Arc<Definition>>> = Lazy::new(|| {
    let mut metrics: HashMap<&'static str, Arc<Definition>> = HashMap::new();
    for (metric, route) in [
        ("emitted_ac_power_setpoint;phase=l1", "AcPowerSetpoint/L1"),
        ("emitted_ac_power_setpoint;phase=l2", "AcPowerSetpoint/L2"),
        ("emitted_ac_power_setpoint;phase=l3", "AcPowerSetpoint/L3"),
    ] {
        metrics.insert(
            metric,
            Arc::new(Definition::new(
                format!("victron_{metric}"),
                "W",
                ValueKind::Instantaneous,
                "power",
                Route::Topic(route.to_string()),
            )),
        );
    }
    for metric in [
        "processing_reconnect_count_total",
        "messages_consumed_total",
        "messages_payload_invalid_total",
        "messages_value_null_total",
        "messages_processed_total",
    ] {
        metrics.insert(
            metric,
            Arc::new(Definition::new(
                format!("victron_{metric}"),
                "-",
                ValueKind::MonotonicIncreasing,
                "-",
                Route::None,
            )),
        );
    }
    metrics
});

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const FULL_CACHE_REFRESH: Duration = Duration::from_secs(240);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Venus OS (VRM) meter over MQTT. Mirrors the device's `N/<id>/...` state
/// tree into the registry and exposes the battery-controller capability by
/// publishing power setpoints back into the `W/<id>/...` tree.
pub struct Victron {
    name: String,
    id: String,
    keepalive_interval: Duration,
    registry: Arc<Registry>,
    client: AsyncClient,
    eventloop: tokio::sync::Mutex<Option<EventLoop>>,
    vebus_id: RwLock<Option<String>>,
    vebus_pattern: Regex,
}

impl Victron {
    pub fn new(registry: Arc<Registry>, config: &config::Victron) -> Result<Arc<Self>> {
        let mut options = MqttOptions::new(
            format!("watt-bridge-{}", config.name),
            config.mqtt_host.clone(),
            config.mqtt_port(),
        );
        options.set_keep_alive(Duration::from_secs(5));
        let (client, eventloop) = AsyncClient::new(options, 64);

        let vebus_pattern = Regex::new(&format!(
            r"^N/{}/vebus/(\d+)/",
            regex::escape(&config.id)
        ))?;

        Ok(Arc::new(Self {
            name: config.name.clone(),
            id: config.id.clone(),
            keepalive_interval: config.keepalive_interval(),
            registry,
            client,
            eventloop: tokio::sync::Mutex::new(Some(eventloop)),
            vebus_id: RwLock::new(None),
            vebus_pattern,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vebus_id(&self) -> Option<String> {
        self.vebus_id.read().unwrap().clone()
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let mut eventloop = self
            .eventloop
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("{}: event loop already taken", self.name))?;

        loop {
            if let Err(err) = self.run(&mut eventloop).await {
                error!("{}: caught error: {err:#}, resetting connection", self.name);
                self.increment("processing_reconnect_count_total", &[], 1.0);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    async fn run(self: &Arc<Self>, eventloop: &mut EventLoop) -> Result<()> {
        self.client
            .subscribe(format!("N/{}/#", self.id), QoS::AtMostOnce)
            .await?;
        self.client
            .publish(format!("R/{}/keepalive", self.id), QoS::AtLeastOnce, false, "")
            .await?;

        let mut last_full = Instant::now();
        let mut last_partial = Instant::now();

        loop {
            match tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                    self.handle_publish(publish)?
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => bail!("mqtt connection error: {err}"),
                Err(_) => {} // idle; fall through to the keepalive checks
            }

            // a full keepalive makes the device republish everything, which
            // is what keeps the age checks honest after missed messages
            if last_full.elapsed() > FULL_CACHE_REFRESH {
                self.client
                    .publish(format!("R/{}/keepalive", self.id), QoS::AtLeastOnce, false, "")
                    .await?;
                last_full = Instant::now();
            } else if last_partial.elapsed() > self.keepalive_interval {
                self.client
                    .publish(
                        format!("R/{}/keepalive", self.id),
                        QoS::AtLeastOnce,
                        false,
                        r#"{ "keepalive-options" : ["suppress-republish"] }"#,
                    )
                    .await?;
                last_partial = Instant::now();
            }
        }
    }

    fn handle_publish(self: &Arc<Self>, publish: Publish) -> Result<()> {
        self.increment("messages_consumed_total", &[], 1.0);
        let topic = publish.topic.as_str();

        if self.vebus_id().is_none() {
            if let Some(capture) = self.vebus_pattern.captures(topic) {
                let found = capture[1].to_string();
                info!("{}: found vebus_id = {found:?}", self.name);
                *self.vebus_id.write().unwrap() = Some(found);
            }
        }

        let Some(definition) = REGISTERS.iter().find(|def| def.route().matches(topic)) else {
            return Ok(());
        };

        let payload: serde_json::Value = match serde_json::from_slice(&publish.payload) {
            Ok(payload) => payload,
            Err(_) => {
                self.increment(
                    "messages_payload_invalid_total",
                    &[("definition", &definition.metric_id())],
                    1.0,
                );
                return Ok(());
            }
        };

        let Some(value) = payload.get("value").and_then(serde_json::Value::as_f64) else {
            self.increment(
                "messages_value_null_total",
                &[("definition", &definition.metric_id())],
                1.0,
            );
            return Ok(());
        };

        self.registry.update(
            Metric::now(definition.clone(), value)
                .with_label("name", &self.name)
                .with_label("id", &self.id)
                .with_origin(self.origin()),
        );
        self.increment("messages_processed_total", &[], 1.0);

        Ok(())
    }

    fn counter(self: &Arc<Self>, key: &str, labels: &[(&str, &str)]) -> Metric {
        let definition = METRICS
            .get(key)
            .unwrap_or_else(|| panic!("unknown victron metric {key:?}"))
            .clone();
        let mut metric = Metric::now(definition, 0.0)
            .with_label("name", &self.name)
            .with_label("id", &self.id)
            .with_origin(self.origin());
        for (label, value) in labels {
            metric = metric.with_label(*label, *value);
        }
        metric
    }

    fn increment(self: &Arc<Self>, key: &str, labels: &[(&str, &str)], delta: f64) {
        if let Err(err) = self.registry.increment(self.counter(key, labels), delta) {
            warn!("{}: failed to increment {key}: {err}", self.name);
        }
    }

    fn origin(self: &Arc<Self>) -> crate::metric::Origin {
        let this: Arc<dyn MeterClassifier> = self.clone();
        Arc::downgrade(&this)
    }
}

impl MeterClassifier for Victron {
    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn power_metric_classifier(&self, fingerprint: &str) -> Option<Phase> {
        if fingerprint.contains("ac_in_power") && has_label(fingerprint, "name", &self.name) {
            phase_label(fingerprint)
        } else {
            None
        }
    }

    fn total_power_metric_classifier(&self, fingerprint: &str) -> bool {
        fingerprint.contains("ac_in_power_total") && has_label(fingerprint, "name", &self.name)
    }
}

impl BatteryController for Victron {
    fn battery_soc_classifier(&self, fingerprint: &str) -> bool {
        fingerprint.contains("dc_soc") && has_label(fingerprint, "name", &self.name)
    }

    fn dc_voltage_classifier(&self, fingerprint: &str) -> bool {
        fingerprint.contains("dc_voltage") && has_label(fingerprint, "name", &self.name)
    }

    fn max_charge_current_classifier(&self, fingerprint: &str) -> bool {
        fingerprint.contains("dc_max_charge_current") && has_label(fingerprint, "name", &self.name)
    }

    /// Publish one phase's power command into the device's write tree and
    /// mirror it into the registry.
    fn setpoint(&self, value: f64, phase: Phase) -> Result<(), Error> {
        let vebus_id = self.vebus_id().ok_or_else(|| {
            Error::InvalidArgument("vebus id not yet discovered, subscribe first".into())
        })?;

        if !value.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "setpoint value not valid: {value}"
            )));
        }

        let key = format!("emitted_ac_power_setpoint;phase={phase}");
        let definition = METRICS
            .get(key.as_str())
            .expect("setpoint definitions exist for every phase")
            .clone();
        self.registry.update(
            Metric::now(definition, value)
                .with_label("name", &self.name)
                .with_label("id", &self.id),
        );

        let topic = format!(
            "W/{}/vebus/{}/Hub4/{}/AcPowerSetpoint",
            self.id,
            vebus_id,
            phase.label().to_uppercase()
        );
        let payload = serde_json::json!({ "value": value }).to_string();
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| Error::Transport(format!("setpoint publish failed: {err}")))
    }
}
