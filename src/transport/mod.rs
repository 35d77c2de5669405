use std::time::Duration;

use crate::error::Result;

pub use self::can::CanBusTransport;

mod can;

/// A raw CAN 2.0 frame as the session sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// 11-bit (standard) or 29-bit (extended) identifier.
    pub id: u32,
    /// Extended frame format.
    pub extended: bool,
    /// Remote transmission request.
    pub rtr: bool,
    pub data: Vec<u8>,
}

impl CanFrame {
    /// A data frame.
    pub fn data(id: u32, extended: bool, data: &[u8]) -> Self {
        CanFrame {
            id,
            extended,
            rtr: false,
            data: data.to_vec(),
        }
    }
}

/// Abstraction of the CAN transport layer.
/// Might be a raw SocketCAN socket, a USB adapter, or a test double.
pub trait Transport {
    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// Wait up to `timeout` for the next frame; `None` on timeout.
    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::{CanFrame, Transport};
    use crate::error::{Error, Result};

    /// One scripted receive slot: a frame, or a poll timeout.
    pub enum Script {
        Frame(CanFrame),
        Idle,
    }

    /// Scripted transport double: hands out the scripted inbound frames in
    /// order and records everything sent. An exhausted script turns into a
    /// transport error so runaway loops fail tests instead of hanging them.
    pub struct MockTransport {
        script: VecDeque<Script>,
        pub sent: Vec<CanFrame>,
    }

    impl MockTransport {
        pub fn new(script: Vec<Script>) -> Self {
            MockTransport {
                script: script.into(),
                sent: Vec::new(),
            }
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, frame: &CanFrame) -> Result<()> {
            self.sent.push(frame.clone());
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Option<CanFrame>> {
            match self.script.pop_front() {
                Some(Script::Frame(frame)) => Ok(Some(frame)),
                Some(Script::Idle) => Ok(None),
                None => Err(Error::Transport("mock script exhausted".into())),
            }
        }
    }
}
