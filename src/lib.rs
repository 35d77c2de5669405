//! CAN bootloader flashing protocol implementation.

pub mod constants;
pub mod device;
pub mod error;
pub mod frame;
pub mod image;
pub mod pinger;
pub mod plan;
pub mod session;
pub mod transport;

pub use self::device::{Catalog, Device};
pub use self::error::{Error, Result};
pub use self::frame::Payload;
pub use self::image::Image;
pub use self::session::{Outcome, Session, SessionConfig, State};
pub use self::transport::{CanBusTransport, CanFrame, Transport};
