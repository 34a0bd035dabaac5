use failure_derive::Fail;

mod serial_link;
mod programmer;
mod jtag_tap;
mod jtag_ops;
mod jedec;
mod sequencer;
mod svf;

pub use serial_link::{BytesAvailable, ReadCompletion, SerialLink};
pub use programmer::{sie, Programmer};
pub use jtag_tap::{TapNavigator, TapState, TapTracker};
pub use jtag_ops::JtagOps;
pub use jedec::{BitstreamFile, FuseMap, JedecFile};
pub use sequencer::{DeviceSequencer, ProgressEvent};
pub use svf::SvfPlayer;
pub use serial_link::test_support;

/// The helper board's USB vendor ID.
pub const ID_VENDOR: u16 = 0x1209;
/// The helper board's USB product ID.
pub const ID_PRODUCT: u16 = 0x2101;

#[derive(Fail, Debug)]
pub enum JflashError {
    #[fail(display = "transport error: {}", _0)]
    Transport(#[cause] std::io::Error),

    #[fail(display = "no programmer device found")]
    NoDeviceFound,

    #[fail(display = "specified programmer port not found")]
    DeviceNotFound,

    #[fail(display = "protocol violation: {}", _0)]
    ProtocolViolation(String),

    #[fail(
        display = "DR check mismatch: expected {:032X} mask {:032X} (firmware status {:#04X})",
        expected, mask, status
    )]
    DeviceCheckMismatch { expected: u128, mask: u128, status: u8 },

    #[fail(display = "device reported non-zero status: {:#04X}", _0)]
    StatusFailure(u8),
}

impl From<std::io::Error> for JflashError {
    fn from(error: std::io::Error) -> Self {
        JflashError::Transport(error)
    }
}

pub type Result<T> = std::result::Result<T, failure::Error>;
