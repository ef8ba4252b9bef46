// Common imports shared by most modules.

pub use crate::config::{self, Config};
pub use crate::error::Error;
pub use crate::metric::{Definition, Metric, Route, ValueKind};
pub use crate::options::Options;
pub use crate::registry::{Registry, Subscriber};

pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};

pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use tokio::sync::{broadcast, mpsc, oneshot};
