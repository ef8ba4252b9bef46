use crate::error::Error;
use crate::metric::{Metric, ValueKind};

use anyhow::Result;
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Anything that wants to observe registry writes. Called synchronously, in
/// registration order, within the producing caller's execution context.
pub trait Subscriber: Send + Sync {
    fn call(&self, fingerprint: &str, metric: &Metric) -> Result<()>;
}

impl<F> Subscriber for F
where
    F: Fn(&str, &Metric) -> Result<()> + Send + Sync,
{
    fn call(&self, fingerprint: &str, metric: &Metric) -> Result<()> {
        self(fingerprint, metric)
    }
}

#[derive(Clone, Debug)]
pub struct Entry {
    pub metric: Metric,
    /// Monotonic instant of the last write whose value differed from the
    /// stored one. Distinct from the metric's wall-clock write timestamp.
    pub last_value_change: Instant,
}

/// Live store of the latest Metric per fingerprint plus the dispatch bus all
/// protocol clients write into. Explicitly constructed and passed around by
/// `Arc`; there is deliberately no process-wide instance.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
    subscribers: RwLock<Vec<(String, Arc<dyn Subscriber>)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert keyed by the metric's fingerprint, then fan out to every
    /// subscriber. Writes to the same fingerprint linearize under the write
    /// lock; subscribers run after the lock is released so they may re-enter
    /// the registry (and themselves produce writes).
    pub fn update(&self, metric: Metric) {
        let fingerprint = metric.fingerprint();
        self.store(&fingerprint, metric.clone());
        self.dispatch(&fingerprint, &metric);
    }

    /// Add `delta` onto the stored value for this metric's fingerprint,
    /// starting from zero for a fresh counter. Only valid for
    /// monotonic-increasing definitions.
    pub fn increment(&self, mut metric: Metric, delta: f64) -> Result<(), Error> {
        if metric.definition().kind() != ValueKind::MonotonicIncreasing {
            return Err(Error::InvalidArgument(format!(
                "kind must be monotonic-increasing to increment {}",
                metric.definition().name()
            )));
        }

        let fingerprint = metric.fingerprint();
        {
            // read-modify-write under one lock so concurrent increments
            // cannot lose updates
            let mut entries = self.entries.write().unwrap();
            let base = entries
                .get(&fingerprint)
                .map(|entry| entry.metric.value())
                .unwrap_or(0.0);
            metric.set_value(base + delta);
            Self::upsert(&mut entries, &fingerprint, metric.clone());
        }
        self.dispatch(&fingerprint, &metric);

        Ok(())
    }

    /// Associate a subscriber with a unique name. Re-registration under an
    /// existing name replaces the subscriber in place, keeping its position
    /// in the dispatch order.
    pub fn register(&self, name: &str, subscriber: Arc<dyn Subscriber>) {
        let mut subscribers = self.subscribers.write().unwrap();
        match subscribers.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = subscriber,
            None => subscribers.push((name.to_string(), subscriber)),
        }
    }

    /// First entry whose fingerprint satisfies the predicate. When several
    /// match, which one is returned depends on unspecified map iteration
    /// order; callers keep lookups unambiguous via producer-unique labels
    /// (`name`/`bms`), not by relying on a winner.
    pub fn lookup_by_predicate<P>(&self, predicate: P) -> Option<(String, Metric)>
    where
        P: Fn(&str) -> bool,
    {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|(fingerprint, _)| predicate(fingerprint))
            .map(|(fingerprint, entry)| (fingerprint.clone(), entry.metric.clone()))
    }

    pub fn get(&self, fingerprint: &str) -> Option<Metric> {
        let entries = self.entries.read().unwrap();
        entries.get(fingerprint).map(|entry| entry.metric.clone())
    }

    /// Wall-clock time since the entry was last written.
    pub fn age(&self, fingerprint: &str) -> Option<Duration> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(fingerprint)?;
        Some(
            chrono::Utc::now()
                .signed_duration_since(entry.metric.timestamp())
                .to_std()
                .unwrap_or_default(),
        )
    }

    /// Time since the entry's value last changed; the basis for staleness
    /// checks, unaffected by same-value rewrites.
    pub fn staleness(&self, fingerprint: &str) -> Option<Duration> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(fingerprint)?;
        Some(entry.last_value_change.elapsed())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    fn store(&self, fingerprint: &str, metric: Metric) {
        let mut entries = self.entries.write().unwrap();
        Self::upsert(&mut entries, fingerprint, metric);
    }

    fn upsert(entries: &mut HashMap<String, Entry>, fingerprint: &str, metric: Metric) {
        match entries.get_mut(fingerprint) {
            Some(entry) => {
                if entry.metric.value() != metric.value() {
                    entry.last_value_change = Instant::now();
                }
                entry.metric = metric;
            }
            None => {
                entries.insert(
                    fingerprint.to_string(),
                    Entry {
                        metric,
                        last_value_change: Instant::now(),
                    },
                );
            }
        }
    }

    fn dispatch(&self, fingerprint: &str, metric: &Metric) {
        // snapshot outside the lock so a subscriber can register/update
        // without deadlocking
        let subscribers: Vec<_> = self.subscribers.read().unwrap().clone();
        for (name, subscriber) in subscribers {
            if let Err(err) = subscriber.call(fingerprint, metric) {
                warn!("failed to run subscriber {name:?}: {err:#}");
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.len())
            .field("subscribers", &self.subscribers.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Definition, Route};
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gauge(name: &str) -> Arc<Definition> {
        Arc::new(Definition::new(
            name,
            "W",
            ValueKind::Instantaneous,
            "power",
            Route::None,
        ))
    }

    fn counter(name: &str) -> Arc<Definition> {
        Arc::new(Definition::new(
            name,
            "-",
            ValueKind::MonotonicIncreasing,
            "-",
            Route::None,
        ))
    }

    #[test]
    fn update_stores_latest_metric() {
        let registry = Registry::new();
        let definition = gauge("power_total");

        registry.update(Metric::now(definition.clone(), 100.0));
        registry.update(Metric::now(definition, 250.0));

        let metric = registry.get("power_total{}").unwrap();
        assert_eq!(metric.value(), 250.0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn staleness_only_resets_on_value_change() {
        let registry = Registry::new();
        let definition = gauge("power_total");

        registry.update(Metric::now(definition.clone(), 100.0));
        std::thread::sleep(Duration::from_millis(20));
        registry.update(Metric::now(definition.clone(), 100.0));

        // same value rewritten: age resets, staleness does not
        assert!(registry.staleness("power_total{}").unwrap() >= Duration::from_millis(20));
        assert!(registry.age("power_total{}").unwrap() < Duration::from_millis(20));

        registry.update(Metric::now(definition, 101.0));
        assert!(registry.staleness("power_total{}").unwrap() < Duration::from_millis(20));
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let registry = Registry::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let seen = seen.clone();
            registry.register(
                name,
                Arc::new(move |_: &str, _: &Metric| {
                    seen.lock().unwrap().push(name);
                    Ok(())
                }),
            );
        }

        registry.update(Metric::now(gauge("power_total"), 1.0));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn erroring_subscriber_is_isolated() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register(
            "broken",
            Arc::new(|_: &str, _: &Metric| -> Result<()> { bail!("always fails") }),
        );
        let counter = calls.clone();
        registry.register(
            "working",
            Arc::new(move |_: &str, _: &Metric| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        // neither the sibling subscriber nor the producing write may be
        // affected by the failure
        registry.update(Metric::now(gauge("power_total"), 1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get("power_total{}").is_some());
    }

    #[test]
    fn reregistration_replaces_in_place() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register("sub", Arc::new(|_: &str, _: &Metric| Ok(())));
        let counter = calls.clone();
        registry.register(
            "sub",
            Arc::new(move |_: &str, _: &Metric| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        registry.update(Metric::now(gauge("power_total"), 1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn increment_accumulates_from_zero() {
        let registry = Registry::new();
        let definition = counter("errors_total");

        let metric = || Metric::now(definition.clone(), 0.0).with_label("error", "timeout");
        registry.increment(metric(), 1.0).unwrap();
        registry.increment(metric(), 2.0).unwrap();

        let stored = registry.get("errors_total{error=\"timeout\"}").unwrap();
        assert_eq!(stored.value(), 3.0);
    }

    #[test]
    fn increment_rejects_instantaneous_definitions() {
        let registry = Registry::new();
        let result = registry.increment(Metric::now(gauge("power_total"), 0.0), 1.0);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn subscriber_may_reenter_the_registry() {
        let registry = Arc::new(Registry::new());
        let definition = counter("echo_total");

        let inner = registry.clone();
        let echo = definition.clone();
        registry.register(
            "echo",
            Arc::new(move |fingerprint: &str, _: &Metric| {
                if !fingerprint.starts_with("echo_total") {
                    inner.increment(Metric::now(echo.clone(), 0.0), 1.0)?;
                }
                Ok(())
            }),
        );

        registry.update(Metric::now(gauge("power_total"), 1.0));
        assert_eq!(registry.get("echo_total{}").unwrap().value(), 1.0);
    }

    #[test]
    fn lookup_by_predicate_scans_entries() {
        let registry = Registry::new();
        registry.update(Metric::now(gauge("a_total"), 1.0));
        registry.update(Metric::now(gauge("b_total"), 2.0));

        let (fingerprint, metric) = registry
            .lookup_by_predicate(|fp| fp.starts_with("b_"))
            .unwrap();
        assert_eq!(fingerprint, "b_total{}");
        assert_eq!(metric.value(), 2.0);
        assert!(registry.lookup_by_predicate(|fp| fp.contains("nope")).is_none());
    }
}
