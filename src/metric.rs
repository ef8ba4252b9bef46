use crate::error::Error;
use crate::meter::MeterClassifier;

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Weak;

/// How a measured quantity behaves over time. Monotonic definitions are the
/// only ones `Registry::increment` accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueKind {
    Instantaneous,
    MonotonicIncreasing,
}

/// Protocol-specific routing token carried by a Definition. For MQTT-fed
/// meters this is the topic (suffix or pattern) a value arrives on; register
/// pollers don't route and use `None`.
#[derive(Clone, Debug)]
pub enum Route {
    None,
    Topic(String),
    Pattern(Regex),
}

impl Route {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Route::None => false,
            Route::Topic(suffix) => topic.ends_with(suffix.as_str()),
            Route::Pattern(re) => re.is_match(topic),
        }
    }
}

/// Static schema entry for one measurable quantity. The `metric` field may
/// embed a label template after a semicolon: `"voltage;phase=l1"`.
#[derive(Clone, Debug)]
pub struct Definition {
    metric: String,
    unit: String,
    kind: ValueKind,
    device_class: String,
    route: Route,
}

impl Definition {
    pub fn new(
        metric: impl Into<String>,
        unit: impl Into<String>,
        kind: ValueKind,
        device_class: impl Into<String>,
        route: Route,
    ) -> Self {
        Self {
            metric: metric.into(),
            unit: unit.into(),
            kind,
            device_class: device_class.into(),
            route,
        }
    }

    /// Metric name without the label template.
    pub fn name(&self) -> &str {
        self.metric.split(';').next().unwrap_or(&self.metric)
    }

    pub fn template_labels(&self) -> BTreeMap<String, String> {
        self.metric
            .split(';')
            .skip(1)
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn device_class(&self) -> &str {
        &self.device_class
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Deterministic identifier: name plus label values in key order.
    pub fn metric_id(&self) -> String {
        let mut id = self.name().to_string();
        for value in self.template_labels().values() {
            id.push('_');
            id.push_str(value);
        }
        id
    }
}

/// Weak handle back to whatever produced a metric. Classification only; a
/// metric must never keep its meter alive.
pub type Origin = Weak<dyn MeterClassifier>;

/// One observation of a Definition.
#[derive(Clone)]
pub struct Metric {
    definition: std::sync::Arc<Definition>,
    value: f64,
    timestamp: DateTime<Utc>,
    labels: BTreeMap<String, String>,
    origin: Option<Origin>,
}

impl Metric {
    pub fn new(
        definition: std::sync::Arc<Definition>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, Error> {
        // a zero timestamp means "uninitialized" upstream and must not enter
        // the registry
        if timestamp.timestamp_millis() == 0 {
            return Err(Error::InvalidArgument("timestamp cannot be 0".into()));
        }

        Ok(Self {
            definition,
            value,
            timestamp,
            labels: BTreeMap::new(),
            origin: None,
        })
    }

    pub fn now(definition: std::sync::Arc<Definition>, value: f64) -> Self {
        Self {
            definition,
            value,
            timestamp: Utc::now(),
            labels: BTreeMap::new(),
            origin: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn label(&self, key: &str) -> Option<String> {
        self.labels
            .get(key)
            .cloned()
            .or_else(|| self.definition.template_labels().get(key).cloned())
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    /// Registry key: `name{key="value",...}` over the union of template and
    /// added labels, keys sorted so the same label set always produces the
    /// same key regardless of insertion order.
    pub fn fingerprint(&self) -> String {
        let mut labels = self.definition.template_labels();
        for (key, value) in &self.labels {
            labels.insert(key.clone(), value.clone());
        }

        let inner = labels
            .iter()
            .map(|(key, value)| format!("{key}=\"{value}\""))
            .collect::<Vec<_>>()
            .join(",");

        format!("{}{{{}}}", self.definition.name(), inner)
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("fingerprint", &self.fingerprint())
            .field("value", &self.value)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn definition() -> Arc<Definition> {
        Arc::new(Definition::new(
            "janitza_voltage;phase=l1",
            "V",
            ValueKind::Instantaneous,
            "voltage",
            Route::None,
        ))
    }

    #[test]
    fn name_strips_label_template() {
        assert_eq!(definition().name(), "janitza_voltage");
    }

    #[test]
    fn metric_id_appends_sorted_label_values() {
        assert_eq!(definition().metric_id(), "janitza_voltage_l1");
    }

    #[test]
    fn fingerprint_merges_and_sorts_labels() {
        let metric = Metric::now(definition(), 230.0).with_label("name", "hak");
        assert_eq!(
            metric.fingerprint(),
            "janitza_voltage{name=\"hak\",phase=\"l1\"}"
        );
    }

    #[test]
    fn fingerprint_is_insertion_order_independent() {
        let a = Metric::now(definition(), 1.0)
            .with_label("b", "2")
            .with_label("a", "1");
        let b = Metric::now(definition(), 1.0)
            .with_label("a", "1")
            .with_label("b", "2");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn added_label_overrides_template_label() {
        let metric = Metric::now(definition(), 1.0).with_label("phase", "l2");
        assert_eq!(metric.fingerprint(), "janitza_voltage{phase=\"l2\"}");
    }

    #[test]
    fn zero_timestamp_is_rejected() {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert!(matches!(
            Metric::new(definition(), 1.0, epoch),
            Err(Error::InvalidArgument(_))
        ));
    }
}
