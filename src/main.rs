use std::io::Read;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use canflash::{CanBusTransport, CanFrame, Catalog, Device, Image, Session, SessionConfig, Transport};

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Hex file to flash, or the output file in read mode (`-` for stdin/stdout)
    #[arg(value_name = "FILE", required_unless_present = "list_parts")]
    file: Option<String>,

    /// CAN interface to use
    #[arg(long, short = 'i', default_value = "can0")]
    iface: String,

    /// Target device part number, e.g. m328p
    #[arg(long, short = 'p', required_unless_present = "list_parts")]
    partno: Option<String>,

    /// 16-bit MCU-ID of the bootloader, decimal or 0x-prefixed hex
    #[arg(long, short = 'm', value_parser = parse_u16, required_unless_present = "list_parts")]
    mcuid: Option<u16>,

    /// Erase the whole flash before writing
    #[arg(long, short = 'e')]
    erase: bool,

    /// Skip the verify pass after writing
    #[arg(long)]
    no_verify: bool,

    /// Read the flash instead of writing it, optionally up to MAX_ADDR
    #[arg(
        long,
        short = 'r',
        value_name = "MAX_ADDR",
        value_parser = parse_u32,
        num_args = 0..=1,
        default_missing_value = "0xFFFFFFFF"
    )]
    read: Option<u32>,

    /// Proceed despite a bootloader protocol version mismatch
    #[arg(long, short = 'F')]
    force: bool,

    /// Frame to emit once at startup, e.g. to reset the target into the bootloader
    #[arg(long, value_name = "ID#HEXBYTES", value_parser = parse_reset_frame)]
    reset: Option<CanFrame>,

    /// CAN-ID the bootloader transmits on
    #[arg(long, value_parser = parse_u32, default_value = "0x1FFFFF01")]
    can_id_mcu: u32,

    /// CAN-ID the host transmits on
    #[arg(long, value_parser = parse_u32, default_value = "0x1FFFFF02")]
    can_id_remote: u32,

    /// Use standard (11-bit) frame format instead of extended
    #[arg(long)]
    sff: bool,

    /// Send keep-alive pings while waiting for the bootloader, every MS milliseconds
    #[arg(
        long,
        value_name = "MS",
        value_parser = clap::value_parser!(u64),
        num_args = 0..=1,
        default_missing_value = "75"
    )]
    ping: Option<u64>,

    /// List the known part numbers and exit
    #[arg(long)]
    list_parts: bool,

    /// Turn debugging information on
    #[arg(long = "verbose", short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if cli.list_parts {
        return list_parts();
    }

    // clap enforces these unless --list-parts is given
    let file = cli.file.clone().context("FILE is required")?;
    let partno = cli.partno.clone().context("--partno is required")?;
    let mcuid = cli.mcuid.context("--mcuid is required")?;

    let device = Device::resolve(&partno)?;
    anyhow::ensure!(
        device.is_known(),
        "unknown part number {partno:?}; run with --list-parts to see supported devices"
    );
    log::info!("Device: {}", device);

    let image = if cli.read.is_some() {
        Image::new()
    } else {
        let text = read_input(&file)?;
        let image = Image::from_ihex(&text)?;
        anyhow::ensure!(!image.is_empty(), "input contains no data records");
        if let Some(end) = image.end_address() {
            anyhow::ensure!(
                end < device.flash_size,
                "image ends at 0x{end:04X} but {} has only {} bytes of flash",
                device.name,
                device.flash_size
            );
        }
        log::info!(
            "Image: {} bytes in {} block(s)",
            image.total_bytes(),
            image.block_count()
        );
        image
    };

    let mut transport = CanBusTransport::open(&cli.iface, cli.can_id_mcu, !cli.sff)?;

    if let Some(reset) = &cli.reset {
        log::info!(
            "sending reset frame {:03X}#{}",
            reset.id,
            hex::encode_upper(&reset.data)
        );
        transport.send(reset)?;
    }

    let cfg = SessionConfig {
        mcu_id: mcuid,
        can_id_mcu: cli.can_id_mcu,
        can_id_remote: cli.can_id_remote,
        extended: !cli.sff,
        signature: device.signature,
        flash_size: device.flash_size,
        erase: cli.erase,
        verify: !cli.no_verify && cli.read.is_none(),
        read: cli.read,
        force: cli.force,
        ping_interval: cli.ping.map(Duration::from_millis),
    };

    let mut session = Session::new(transport, cfg, &image);
    let cancel = session.cancel_flag();
    ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))?;

    log::info!(
        "waiting for bootloader (MCU-ID 0x{mcuid:04X}) on {} ...",
        cli.iface
    );
    session.run()?;

    if cli.read.is_some() {
        let read = session
            .take_read_image()
            .context("no data was read from the target")?;
        let text = read.to_ihex()?;
        if file == "-" {
            print!("{text}");
        } else {
            std::fs::write(&file, &text).with_context(|| format!("cannot write {file}"))?;
            log::info!("saved {} bytes to {file}", read.total_bytes());
        }
    }

    Ok(())
}

fn list_parts() -> Result<()> {
    let catalog = Catalog::load()?;
    for part in catalog.parts() {
        println!(
            "{:12} signature {}  flash {:4} KiB",
            part.name,
            hex::encode_upper(part.signature),
            part.flash_size / 1024
        );
    }
    Ok(())
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("cannot read hex data from stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("cannot read {file}"))
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hexpart) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hexpart, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_u32(s)?;
    u16::try_from(value).map_err(|_| format!("{s:?} does not fit into 16 bits"))
}

/// Parse a `<can_id>#<hex_bytes>` frame spec. A 3-digit id selects standard
/// frame format, an 8-digit id extended; data bytes are hex pairs.
fn parse_reset_frame(s: &str) -> Result<CanFrame, String> {
    let (id_part, data_part) = s
        .split_once('#')
        .ok_or_else(|| format!("expected <can_id>#<hex_bytes>, got {s:?}"))?;

    let extended = match id_part.len() {
        3 => false,
        8 => true,
        _ => return Err(format!("CAN-ID {id_part:?} must be 3 (SFF) or 8 (EFF) hex digits")),
    };
    let id = u32::from_str_radix(id_part, 16).map_err(|e| format!("invalid CAN-ID {id_part:?}: {e}"))?;
    if !extended && id > 0x7FF {
        return Err(format!("standard CAN-ID 0x{id:03X} exceeds 11 bits"));
    }
    if id > 0x1FFF_FFFF {
        return Err(format!("extended CAN-ID 0x{id:08X} exceeds 29 bits"));
    }

    let data = hex::decode(data_part).map_err(|e| format!("invalid data bytes {data_part:?}: {e}"))?;
    if data.len() > 8 {
        return Err(format!("{} data bytes exceed the CAN frame limit of 8", data.len()));
    }

    Ok(CanFrame::data(id, extended, &data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canflash::constants::{DEFAULT_CAN_ID_MCU, DEFAULT_CAN_ID_REMOTE, DEFAULT_PING_INTERVAL_MS};
    use clap::CommandFactory;

    #[test]
    fn cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["canflash", "app.hex", "-p", "m328p", "-m", "0x42"]).unwrap();
        assert_eq!(cli.file.as_deref(), Some("app.hex"));
        assert_eq!(cli.iface, "can0");
        assert_eq!(cli.mcuid, Some(0x42));
        assert_eq!(cli.can_id_mcu, DEFAULT_CAN_ID_MCU);
        assert_eq!(cli.can_id_remote, DEFAULT_CAN_ID_REMOTE);
        assert!(!cli.erase && !cli.no_verify && !cli.force && !cli.sff);
        assert_eq!(cli.read, None);
        assert_eq!(cli.ping, None);
    }

    #[test]
    fn cli_read_flag_with_and_without_limit() {
        let cli =
            Cli::try_parse_from(["canflash", "out.hex", "-p", "m328p", "-m", "66", "--read"])
                .unwrap();
        assert_eq!(cli.read, Some(u32::MAX));

        let cli = Cli::try_parse_from([
            "canflash", "out.hex", "-p", "m328p", "-m", "66", "--read", "0x4000",
        ])
        .unwrap();
        assert_eq!(cli.read, Some(0x4000));
    }

    #[test]
    fn cli_ping_default_interval() {
        let cli =
            Cli::try_parse_from(["canflash", "app.hex", "-p", "m328p", "-m", "66", "--ping"])
                .unwrap();
        assert_eq!(cli.ping, Some(DEFAULT_PING_INTERVAL_MS));

        let cli = Cli::try_parse_from([
            "canflash", "app.hex", "-p", "m328p", "-m", "66", "--ping", "200",
        ])
        .unwrap();
        assert_eq!(cli.ping, Some(200));
    }

    #[test]
    fn cli_requires_file_partno_and_mcuid() {
        assert!(Cli::try_parse_from(["canflash"]).is_err());
        assert!(Cli::try_parse_from(["canflash", "app.hex"]).is_err());
        assert!(Cli::try_parse_from(["canflash", "--list-parts"]).is_ok());
    }

    #[test]
    fn parse_numbers_accept_decimal_and_hex() {
        assert_eq!(parse_u32("42").unwrap(), 42);
        assert_eq!(parse_u32("0x2A").unwrap(), 0x2A);
        assert_eq!(parse_u32("0X2a").unwrap(), 0x2A);
        assert_eq!(parse_u16("0xFFFF").unwrap(), 0xFFFF);
        assert!(parse_u16("0x10000").is_err());
        assert!(parse_u32("zz").is_err());
    }

    #[test]
    fn parse_reset_frame_sff() {
        let frame = parse_reset_frame("123#DEADBEEF").unwrap();
        assert_eq!(frame.id, 0x123);
        assert!(!frame.extended);
        assert_eq!(frame.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn parse_reset_frame_eff_and_empty_data() {
        let frame = parse_reset_frame("1FFFFF00#").unwrap();
        assert_eq!(frame.id, 0x1FFF_FF00);
        assert!(frame.extended);
        assert!(frame.data.is_empty());
    }

    #[test]
    fn parse_reset_frame_rejects_malformed_specs() {
        assert!(parse_reset_frame("123").is_err());
        assert!(parse_reset_frame("12#00").is_err());
        assert!(parse_reset_frame("1234#00").is_err());
        assert!(parse_reset_frame("FFF#00").is_err());
        assert!(parse_reset_frame("123#0").is_err());
        assert!(parse_reset_frame("123#001122334455667788").is_err());
    }
}
