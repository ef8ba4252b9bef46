// Module declarations for the application's core components
pub mod charge_controller; // Closed-loop setpoint control law
pub mod config;            // Configuration management
pub mod error;             // Typed error taxonomy
pub mod janitza;           // Janitza power analyser Modbus poller
pub mod meter;             // Meter capability traits and phase model
pub mod metric;            // Definitions, metrics, fingerprints
pub mod options;           // Command line options parsing
pub mod prelude;           // Common imports and types
pub mod registry;          // Concurrent metric store and dispatch bus
pub mod seplos;            // Seplos BMS binary protocol client
pub mod utils;             // Wire-field sub-parsers
pub mod victron;           // Victron Venus OS MQTT meter / battery controller

use crate::charge_controller::ChargeController;
use crate::janitza::Janitza;
use crate::meter::{BatteryController, MeterClassifier};
use crate::prelude::*;
use crate::seplos::Seplos;
use crate::victron::Victron;

use std::collections::HashMap;
use std::io::Write;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_logging(loglevel: &str) {
    let result = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(loglevel),
    )
    .format(|buf, record| {
        writeln!(
            buf,
            "[{} {} {}] {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.module_path().unwrap_or(""),
            record.args()
        )
    })
    .write_style(env_logger::WriteStyle::Never)
    .try_init();

    if let Err(err) = result {
        eprintln!("failed to initialize logging: {err}");
    }
}

/// Build everything from config and run until the shutdown signal fires.
/// One supervised task per device connection; the registry is the only thing
/// they share.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, config: Config) -> Result<()> {
    init_logging(config.loglevel());
    info!("starting watt-bridge {CARGO_PKG_VERSION}");

    let registry = Arc::new(Registry::new());

    let mut classifiers: HashMap<String, Arc<dyn MeterClassifier>> = HashMap::new();
    let mut battery_controllers: HashMap<String, Arc<dyn BatteryController>> = HashMap::new();
    let mut handles = Vec::new();

    for meter in &config.meters {
        match meter {
            config::Meter::Janitza(meter_config) => {
                let meter = Janitza::new(registry.clone(), meter_config);
                classifiers.insert(meter_config.name.clone(), meter.clone());
                handles.push(tokio::spawn(async move {
                    if let Err(err) = meter.start().await {
                        error!("janitza task failed: {err:#}");
                    }
                }));
            }
            config::Meter::Seplos(meter_config) => {
                let meter = Seplos::new(registry.clone(), meter_config);
                handles.push(tokio::spawn(async move {
                    if let Err(err) = meter.start().await {
                        error!("seplos task failed: {err:#}");
                    }
                }));
            }
            config::Meter::Victron(meter_config) => {
                let meter = Victron::new(registry.clone(), meter_config)?;
                classifiers.insert(meter_config.name.clone(), meter.clone());
                battery_controllers.insert(meter_config.name.clone(), meter.clone());
                handles.push(tokio::spawn(async move {
                    if let Err(err) = meter.start().await {
                        error!("victron task failed: {err:#}");
                    }
                }));
            }
        }
    }
    info!("started {} meters", handles.len());

    if let Some(cc) = &config.charge_controller {
        let grid_meter = classifiers
            .get(&cc.grid_meter_name)
            .cloned()
            .ok_or_else(|| anyhow!("grid meter {:?} has no classifier capability", cc.grid_meter_name))?;
        let battery_meter = classifiers
            .get(&cc.battery_meter_name)
            .cloned()
            .ok_or_else(|| {
                anyhow!("battery meter {:?} has no classifier capability", cc.battery_meter_name)
            })?;
        let battery_controller = battery_controllers
            .get(&cc.battery_controller_name)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "meter {:?} has no battery controller capability",
                    cc.battery_controller_name
                )
            })?;

        let controller =
            ChargeController::new(grid_meter, battery_meter, battery_controller, cc.options())?;
        registry.register("charge-controller", Arc::new(controller));
        info!("charge controller registered");
    }

    let _ = shutdown_rx.recv().await;
    info!("shutdown signal received, stopping meters");
    for handle in &handles {
        handle.abort();
    }

    Ok(())
}
