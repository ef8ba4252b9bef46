use super::frame::Frame;
use super::{settings, telemetry, telesignal};
use crate::prelude::*;

use enum_dispatch::enum_dispatch;
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    Telemetry = 0x42,
    Telesignal = 0x44,
    Settings = 0x47,
}

// Every request kind owns its payload decode; the client only moves frames.
#[enum_dispatch]
pub trait RequestCommon {
    fn command(&self) -> CommandCode;

    /// Counter label for this request kind.
    fn label(&self) -> &'static str;

    /// Decode a normal response's info field into registry updates.
    fn process(&self, bms: &str, registry: &Registry, info: &[u8]) -> Result<(), Error>;
}

#[enum_dispatch(RequestCommon)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Request {
    Telemetry(TelemetryRequest),
    Telesignal(TelesignalRequest),
    Settings(SettingsRequest),
}

impl Request {
    pub fn all() -> [Request; 3] {
        [
            SettingsRequest.into(),
            TelemetryRequest.into(),
            TelesignalRequest.into(),
        ]
    }

    /// Wire frame for this request. The info field is the fixed `01` command
    /// qualifier for all three kinds.
    pub fn frame(&self, address: u8) -> Frame {
        Frame::request(address, self.command().into(), &[0x01])
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TelemetryRequest;

impl RequestCommon for TelemetryRequest {
    fn command(&self) -> CommandCode {
        CommandCode::Telemetry
    }

    fn label(&self) -> &'static str {
        "telemetry_request"
    }

    fn process(&self, bms: &str, registry: &Registry, info: &[u8]) -> Result<(), Error> {
        telemetry::process(bms, registry, info)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TelesignalRequest;

impl RequestCommon for TelesignalRequest {
    fn command(&self) -> CommandCode {
        CommandCode::Telesignal
    }

    fn label(&self) -> &'static str {
        "telesignal_request"
    }

    fn process(&self, bms: &str, registry: &Registry, info: &[u8]) -> Result<(), Error> {
        telesignal::process(bms, registry, info)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SettingsRequest;

impl RequestCommon for SettingsRequest {
    fn command(&self) -> CommandCode {
        CommandCode::Settings
    }

    fn label(&self) -> &'static str {
        "settings_request"
    }

    fn process(&self, bms: &str, registry: &Registry, info: &[u8]) -> Result<(), Error> {
        settings::process(bms, registry, info)
    }
}

/// A request sitting in the work queue. Expiry is judged at dequeue time;
/// an expired request is discarded without ever touching the socket.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub request: Request,
    pub enqueued_at: Instant,
    pub timeout: Duration,
}

impl PendingRequest {
    pub fn expired(&self) -> bool {
        self.enqueued_at.elapsed() > self.timeout
    }
}
