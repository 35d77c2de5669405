//! Linux SocketCAN transport.
use std::io::ErrorKind;
use std::time::Duration;

use socketcan::{CanFilter, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, SocketOptions, StandardId};

use super::{CanFrame, Transport};
use crate::error::{Error, Result};

const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_RTR_FLAG: u32 = 0x4000_0000;
const CAN_SFF_MASK: u32 = 0x0000_07FF;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

pub struct CanBusTransport {
    socket: CanSocket,
}

impl CanBusTransport {
    /// Open a CAN interface (e.g. `can0`) with a kernel filter matching only
    /// data frames on the given receive CAN-ID.
    pub fn open(iface: &str, rx_id: u32, extended: bool) -> Result<Self> {
        let socket = CanSocket::open(iface)
            .map_err(|e| Error::Transport(format!("cannot open CAN interface {iface}: {e}")))?;

        let filter = if extended {
            CanFilter::new(rx_id | CAN_EFF_FLAG, CAN_EFF_MASK | CAN_EFF_FLAG | CAN_RTR_FLAG)
        } else {
            CanFilter::new(rx_id, CAN_SFF_MASK | CAN_EFF_FLAG | CAN_RTR_FLAG)
        };
        socket
            .set_filters(&[filter])
            .map_err(|e| Error::Transport(format!("cannot set CAN filter on {iface}: {e}")))?;

        log::debug!("opened {iface}, listening for CAN-ID 0x{rx_id:08X}");
        Ok(CanBusTransport { socket })
    }
}

fn make_id(id: u32, extended: bool) -> Result<Id> {
    if extended {
        ExtendedId::new(id)
            .map(Id::Extended)
            .ok_or_else(|| Error::Config(format!("invalid extended CAN-ID 0x{id:08X}")))
    } else {
        u16::try_from(id)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
            .ok_or_else(|| Error::Config(format!("invalid standard CAN-ID 0x{id:03X}")))
    }
}

fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

impl Transport for CanBusTransport {
    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let id = make_id(frame.id, frame.extended)?;
        let raw = if frame.rtr {
            socketcan::CanFrame::new_remote(id, frame.data.len())
        } else {
            socketcan::CanFrame::new(id, &frame.data)
        }
        .ok_or_else(|| Error::Transport(format!("cannot build CAN frame for 0x{:08X}", frame.id)))?;

        self.socket
            .write_frame(&raw)
            .map_err(|e| Error::Transport(format!("send failed: {e}")))?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        self.socket.set_read_timeout(timeout)?;
        match self.socket.read_frame() {
            Ok(socketcan::CanFrame::Data(frame)) => Ok(Some(CanFrame {
                id: raw_id(frame.id()),
                extended: frame.is_extended(),
                rtr: false,
                data: frame.data().to_vec(),
            })),
            // remote and error frames carry nothing the bootloader dialogue uses
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
