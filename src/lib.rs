// src/lib.rs
//
// Host-side library for talking to a Buderus WPS heat pump over CAN bus
// through a USBtin adapter speaking the Lawicel/slcan ASCII protocol.

pub mod broadcast;
pub mod cache;
pub mod codec;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod fallback_table;
pub mod frame;
pub mod slcan;
pub mod table;
pub mod transport;

pub use broadcast::{BroadcastCache, BroadcastReading};
pub use cache::ParameterCache;
pub use codec::{DecodedValue, EncodeInput};
pub use engine::{DiscoveryTimeouts, Engine, ParameterSource, ReadOutcome, ReadSource};
pub use error::{Error, Result};
pub use frame::CanFrame;
pub use slcan::SlcanLink;
pub use table::{Parameter, ParameterTable};
pub use transport::{open_serial, SerialTransport};

/// Default serial bitrate for the USBtin adapter.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
