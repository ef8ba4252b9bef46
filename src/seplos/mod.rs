// Seplos-class BMS protocol client: ASCII-hex frames over TCP, one request
// on the wire at a time, each request kind owning its payload decode.

pub mod client;
pub mod decoder;
pub mod frame;
pub mod interpack;
pub mod request;
pub mod settings;
pub mod telemetry;
pub mod telesignal;

pub use client::Seplos;
pub use frame::{Frame, ResponseCode};
pub use request::{CommandCode, PendingRequest, Request};
