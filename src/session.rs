//! The bootloader dialogue engine.
//!
//! A session owns the CAN transport and drives the request/response cycle
//! with the target: wait for `BOOTLOADER_START`, stream the image as 4-byte
//! `FLASH_DATA` frames with address resynchronization, then either verify
//! the written flash by reading it back or read out the whole program space
//! into a buffer. Everything is single-threaded; one inbound frame is
//! processed to completion (including any outbound frames it triggers)
//! before the next one is accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{commands, BOOTLOADER_CMD_VERSION, FLASHEND_PROBE_ADDRESS};
use crate::error::{Error, Result};
use crate::frame::Payload;
use crate::image::Image;
use crate::pinger::Pinger;
use crate::plan::TransferPlan;
use crate::transport::{CanFrame, Transport};

/// How long one poll iteration waits for an inbound frame.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the bootloader to announce itself.
    Init,
    /// Streaming image data to the target.
    Flashing,
    /// Reading flash back, either to verify or to dump it.
    Reading,
    Done(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Everything the operator configures for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 16-bit session identifier carried in every frame.
    pub mcu_id: u16,
    /// CAN-ID the target transmits on; inbound frames on any other ID are dropped.
    pub can_id_mcu: u32,
    /// CAN-ID the host transmits on.
    pub can_id_remote: u32,
    /// Use 29-bit extended CAN identifiers.
    pub extended: bool,
    /// Expected 3-byte device signature.
    pub signature: [u8; 3],
    /// Total flash size of the part, bootloader section included.
    pub flash_size: u32,
    /// Erase the whole flash before writing.
    pub erase: bool,
    /// Read the flash back after writing and compare against the image.
    pub verify: bool,
    /// Read mode: dump flash instead of writing, capped at this address.
    pub read: Option<u32>,
    /// Continue despite a bootloader protocol version mismatch.
    pub force: bool,
    /// Keep-alive ping interval while waiting for the bootloader.
    pub ping_interval: Option<Duration>,
}

pub struct Session<T: Transport> {
    transport: T,
    cfg: SessionConfig,
    state: State,
    plan: TransferPlan,
    pinger: Pinger,
    erase_pending: bool,
    /// The verify pass has started (FLASH_DONE_VERIFY echo received).
    verify_running: bool,
    /// Next flash address the host intends to read or write.
    current_address: u32,
    /// Last address the target reported in a FLASH_READY frame.
    remote_address: u32,
    read_until: u32,
    read_buffer: Vec<u8>,
    read_image: Option<Image>,
    flash_started: Option<Instant>,
    next_progress: usize,
    failure: Option<Error>,
    cancel: Arc<AtomicBool>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, cfg: SessionConfig, image: &Image) -> Self {
        if let Some(interval) = cfg.ping_interval {
            log::info!("keep-alive ping every {} ms", interval.as_millis());
        }
        Session {
            pinger: Pinger::new(cfg.ping_interval),
            erase_pending: cfg.erase,
            plan: TransferPlan::new(image),
            transport,
            cfg,
            state: State::Init,
            verify_running: false,
            current_address: 0,
            remote_address: 0,
            read_until: 0,
            read_buffer: Vec::new(),
            read_image: None,
            flash_started: None,
            next_progress: 10,
            failure: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that cancels the session when set (e.g. from a Ctrl-C handler).
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// The image read back from the target, available after a successful
    /// read-mode session. One block starting at address 0.
    pub fn take_read_image(&mut self) -> Option<Image> {
        self.read_image.take()
    }

    fn is_read_mode(&self) -> bool {
        self.cfg.read.is_some()
    }

    /// Drive the session to completion.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                self.pinger.cancel();
                let _ = self.send(Payload::new(self.cfg.mcu_id, commands::START_APP));
                self.state = State::Done(Outcome::Failure);
                return Err(Error::Cancelled);
            }
            match self.state {
                State::Done(Outcome::Success) => return Ok(()),
                State::Done(Outcome::Failure) => {
                    return Err(self
                        .failure
                        .take()
                        .unwrap_or_else(|| Error::Peer("session failed".into())))
                }
                _ => (),
            }
            self.poll()?;
        }
    }

    /// One scheduler iteration: at most one inbound frame, then a ping tick.
    pub fn poll(&mut self) -> Result<()> {
        if let Some(frame) = self.transport.recv(POLL_INTERVAL)? {
            self.handle_frame(&frame)?;
        }
        if self.state == State::Init && self.pinger.due(Instant::now()) {
            self.send(Payload::new(self.cfg.mcu_id, commands::PING))?;
        }
        Ok(())
    }

    /// Process one inbound frame. Frames with the wrong CAN-ID, a payload
    /// length other than 8 or a foreign MCU-ID are silently dropped.
    pub fn handle_frame(&mut self, frame: &CanFrame) -> Result<()> {
        if frame.id != self.cfg.can_id_mcu {
            return Ok(());
        }
        let Some(payload) = Payload::decode(&frame.data) else {
            return Ok(());
        };
        if payload.mcu_id != self.cfg.mcu_id {
            return Ok(());
        }
        log::debug!("<= {}", hex::encode(frame.data.as_slice()));
        match self.state {
            State::Init => self.handle_init(&payload),
            State::Flashing => self.handle_flashing(&payload),
            State::Reading => self.handle_reading(&payload),
            State::Done(_) => Ok(()),
        }
    }

    fn handle_init(&mut self, payload: &Payload) -> Result<()> {
        match payload.command {
            commands::BOOTLOADER_START => {
                let signature = &payload.tail[..3];
                if signature != self.cfg.signature {
                    let error = Error::ProtocolMismatch(format!(
                        "device signature {} does not match expected {}",
                        hex::encode_upper(signature),
                        hex::encode_upper(self.cfg.signature),
                    ));
                    log::error!("{error}");
                    return Ok(());
                }
                let version = payload.tail[3];
                if version != BOOTLOADER_CMD_VERSION {
                    let error = Error::ProtocolMismatch(format!(
                        "bootloader protocol version 0x{version:02X}, \
                         expected 0x{BOOTLOADER_CMD_VERSION:02X}"
                    ));
                    if self.cfg.force {
                        log::warn!("{error}, continuing anyway (force)");
                    } else {
                        log::error!("{error}; use --force to override");
                        return Ok(());
                    }
                }
                self.pinger.cancel();
                self.flash_started = Some(Instant::now());
                log::info!(
                    "bootloader detected, starting {}",
                    if self.is_read_mode() { "read-back" } else { "flash" }
                );
                let mut init = Payload::new(self.cfg.mcu_id, commands::FLASH_INIT);
                init.tail[..3].copy_from_slice(&self.cfg.signature);
                self.send(init)
            }
            commands::FLASH_READY => {
                self.remote_address = payload.address();
                if self.is_read_mode() {
                    // provoke an address error that reveals FLASHEND_BL
                    self.send(Payload::with_address(
                        self.cfg.mcu_id,
                        commands::FLASH_SET_ADDRESS,
                        FLASHEND_PROBE_ADDRESS,
                    ))
                } else if self.erase_pending {
                    self.erase_pending = false;
                    log::info!("erasing flash");
                    self.send(Payload::new(self.cfg.mcu_id, commands::FLASH_ERASE))
                } else {
                    self.pinger.cancel();
                    self.state = State::Flashing;
                    self.plan.begin();
                    self.write_step()
                }
            }
            commands::FLASH_ADDRESS_ERROR if self.is_read_mode() => {
                let flashend = payload.address();
                let program_size = flashend.wrapping_add(1);
                let bootloader_size = self.cfg.flash_size.saturating_sub(program_size);
                log::info!(
                    "program space 0x{program_size:04X} bytes, bootloader 0x{bootloader_size:04X} bytes"
                );
                let cap = self.cfg.read.unwrap_or(u32::MAX);
                self.read_until = cap.min(program_size);
                self.current_address = 0;
                self.pinger.cancel();
                self.state = State::Reading;
                self.send(Payload::with_address(self.cfg.mcu_id, commands::FLASH_READ, 0))
            }
            other => {
                log::warn!("ignoring command 0x{other:02X} while waiting for the bootloader");
                Ok(())
            }
        }
    }

    fn handle_flashing(&mut self, payload: &Payload) -> Result<()> {
        match payload.command {
            commands::FLASH_READY => {
                let confirmed = payload.byte_count() as usize;
                self.plan.advance(confirmed);
                self.remote_address = payload.address();
                self.log_progress();
                self.write_step()
            }
            commands::FLASH_DATA_ERROR => {
                log::error!(
                    "target reported a flash data error near 0x{:04X}; \
                     waiting for the bootloader to recover",
                    self.current_address
                );
                Ok(())
            }
            commands::FLASH_ADDRESS_ERROR => {
                log::error!(
                    "target reported a flash address error near 0x{:04X}; \
                     waiting for the bootloader to recover",
                    self.current_address
                );
                Ok(())
            }
            commands::START_APP => {
                self.finish_ok();
                Ok(())
            }
            other => {
                log::warn!("ignoring command 0x{other:02X} while flashing");
                Ok(())
            }
        }
    }

    fn handle_reading(&mut self, payload: &Payload) -> Result<()> {
        match payload.command {
            commands::FLASH_DONE_VERIFY => {
                // the target echoes our FLASH_DONE_VERIFY; start the verify pass
                if self.verify_running {
                    log::warn!("duplicate verify handshake, ignoring");
                    return Ok(());
                }
                self.plan.begin();
                self.verify_running = true;
                match self.plan.cursor_address() {
                    Some(address) => {
                        self.current_address = address;
                        self.send(Payload::with_address(
                            self.cfg.mcu_id,
                            commands::FLASH_READ,
                            address,
                        ))
                    }
                    None => self.succeed_with_start_app(),
                }
            }
            commands::FLASH_READ_DATA => self.handle_read_data(payload),
            commands::FLASH_READ_ADDRESS_ERROR => {
                if self.is_read_mode() {
                    // natural end of the readable program space
                    self.finalize_read()
                } else {
                    self.abort(Error::Peer(format!(
                        "read failed during verify at 0x{:04X}",
                        self.current_address
                    )))
                }
            }
            commands::START_APP => {
                self.finish_ok();
                Ok(())
            }
            other => {
                log::warn!("ignoring command 0x{other:02X} while reading");
                Ok(())
            }
        }
    }

    fn handle_read_data(&mut self, payload: &Payload) -> Result<()> {
        if payload.addr_low5() != (self.current_address & 0x1F) as u8 {
            return self.abort(Error::InvariantViolation(format!(
                "read data for address fragment 0x{:02X} does not match 0x{:04X}",
                payload.addr_low5(),
                self.current_address
            )));
        }
        let bytes = payload.data().to_vec();
        if self.is_read_mode() {
            self.read_buffer.extend_from_slice(&bytes);
            self.current_address = self.current_address.wrapping_add(bytes.len() as u32);
            if self.current_address > self.read_until {
                self.finalize_read()
            } else {
                self.send(Payload::with_address(
                    self.cfg.mcu_id,
                    commands::FLASH_READ,
                    self.current_address,
                ))
            }
        } else {
            if !self.verify_running {
                log::warn!("read data before the verify handshake, ignoring");
                return Ok(());
            }
            self.verify_chunk(&bytes)
        }
    }

    /// Compare one delivered chunk against the image. Only addresses inside
    /// the current block count, so every image byte is checked exactly once.
    fn verify_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let in_block = self.plan.remaining_in_block().min(bytes.len());
        for (i, &actual) in bytes[..in_block].iter().enumerate() {
            let address = self.current_address.wrapping_add(i as u32);
            if let Some(expected) = self.plan.expect_byte(address) {
                if expected != actual {
                    return self.abort(Error::VerifyMismatch {
                        address,
                        expected,
                        actual,
                    });
                }
            }
        }
        self.plan.advance(in_block);
        match self.plan.cursor_address() {
            Some(next) => {
                self.current_address = next;
                self.send(Payload::with_address(
                    self.cfg.mcu_id,
                    commands::FLASH_READ,
                    next,
                ))
            }
            None => {
                log::info!("verified {} bytes", self.plan.total_bytes());
                self.succeed_with_start_app()
            }
        }
    }

    /// Send the next write-mode frame: data at the target's address, an
    /// address resync, or the end-of-image handshake.
    fn write_step(&mut self) -> Result<()> {
        match self.plan.peek_chunk() {
            Some(chunk) => {
                self.current_address = chunk.address;
                if chunk.address != self.remote_address {
                    log::debug!(
                        "address resync: target at 0x{:04X}, image continues at 0x{:04X}",
                        self.remote_address,
                        chunk.address
                    );
                    self.send(Payload::with_address(
                        self.cfg.mcu_id,
                        commands::FLASH_SET_ADDRESS,
                        chunk.address,
                    ))
                } else {
                    self.send(Payload::with_data(
                        self.cfg.mcu_id,
                        commands::FLASH_DATA,
                        chunk.address,
                        &chunk.bytes,
                    ))
                }
            }
            None => {
                if self.cfg.verify {
                    log::info!("wrote {} bytes, verifying", self.plan.total_bytes());
                    self.state = State::Reading;
                    self.verify_running = false;
                    self.send(Payload::new(self.cfg.mcu_id, commands::FLASH_DONE_VERIFY))
                } else {
                    log::info!("wrote {} bytes", self.plan.total_bytes());
                    self.send(Payload::new(self.cfg.mcu_id, commands::FLASH_DONE))
                }
            }
        }
    }

    fn finalize_read(&mut self) -> Result<()> {
        let limit = (self.read_until as usize).saturating_add(1);
        if self.read_buffer.len() > limit {
            self.read_buffer.truncate(limit);
        }
        log::info!("read {} bytes from flash", self.read_buffer.len());
        let mut image = Image::new();
        if !self.read_buffer.is_empty() {
            image.insert(0, &self.read_buffer);
        }
        self.read_image = Some(image);
        self.succeed_with_start_app()
    }

    fn succeed_with_start_app(&mut self) -> Result<()> {
        self.send(Payload::new(self.cfg.mcu_id, commands::START_APP))?;
        self.finish_ok();
        Ok(())
    }

    fn finish_ok(&mut self) {
        self.pinger.cancel();
        if let Some(started) = self.flash_started {
            log::info!("done in {:.2} s", started.elapsed().as_secs_f64());
        }
        self.state = State::Done(Outcome::Success);
    }

    /// Fatal error: hand control back to the application and stop.
    fn abort(&mut self, error: Error) -> Result<()> {
        self.pinger.cancel();
        let _ = self.send(Payload::new(self.cfg.mcu_id, commands::START_APP));
        self.failure = Some(error);
        self.state = State::Done(Outcome::Failure);
        Ok(())
    }

    fn send(&mut self, payload: Payload) -> Result<()> {
        let frame = CanFrame::data(
            self.cfg.can_id_remote,
            self.cfg.extended,
            &payload.to_bytes(),
        );
        log::debug!("=> {}", hex::encode(frame.data.as_slice()));
        self.transport.send(&frame)
    }

    fn log_progress(&mut self) {
        let total = self.plan.total_bytes();
        if total == 0 {
            return;
        }
        let percent = self.plan.transferred() * 100 / total;
        if percent >= self.next_progress {
            log::info!("written {percent}% ({} / {total} bytes)", self.plan.transferred());
            while self.next_progress <= percent {
                self.next_progress += 10;
            }
        }
    }
}
