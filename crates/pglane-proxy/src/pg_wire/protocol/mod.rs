//! Wire protocol messages, framing and constants

pub mod constants;
pub mod messages;
pub mod startup;

pub use startup::{encode_startup, parse_parameters, read_frame, StartupFrame};
