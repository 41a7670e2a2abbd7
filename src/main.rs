use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use inquire::Select;
use ppm_boot::chip;
use ppm_boot::error::ErrorCode;
use ppm_boot::hex::HexImage;
use ppm_boot::line::{LineDriver, LineError, PlatformLine};
use ppm_boot::orchestrator::{self, Action, Memory, PowerControl};
use ppm_boot::settings::PpmBootConfig;
use serialport::SerialPort;
use std::cell::RefCell;
use std::fs;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Duration;

#[derive(Parser)]
#[clap(name = "ppm-boot")]
#[clap(about = "Host bootloader for the single-wire PPM programming protocol")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Program a memory region from an Intel-HEX image.
    Program(MemoryAction),
    /// Verify a memory region against an Intel-HEX image.
    Verify(MemoryAction),
    /// List the chips known to the built-in catalog.
    ListChips,
}

#[derive(Args)]
struct MemoryAction {
    /// Memory region to act on.
    #[clap(value_enum)]
    memory: MemoryArg,
    /// Path to the Intel-HEX image.
    hex: String,
    /// Serial port the PPM adapter is attached to. Prompts if omitted.
    #[clap(short, long)]
    port: Option<String>,
    /// Average PPM bitrate, in bits/second.
    #[clap(short, long)]
    bitrate: Option<u32>,
    /// The user cycles target power manually instead of the host doing it.
    #[clap(long)]
    manual_power: bool,
    /// Ack-less broadcast mode, for buses shared by multiple targets.
    #[clap(long)]
    broadcast: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum MemoryArg {
    Flash,
    FlashCs,
    Nvram,
}

impl From<MemoryArg> for Memory {
    fn from(value: MemoryArg) -> Self {
        match value {
            MemoryArg::Flash => Memory::Flash,
            MemoryArg::FlashCs => Memory::FlashCs,
            MemoryArg::Nvram => Memory::Nvram,
        }
    }
}

fn main() {
    let args = Cli::parse();
    match args.command {
        Commands::Program(action) => run_action(action, Action::Program),
        Commands::Verify(action) => run_action(action, Action::Verify),
        Commands::ListChips => list_chips(),
    }
}

fn list_chips() {
    println!("{}", "known chips:".bright_blue().bold());
    for chip in chip::catalog() {
        println!(
            "  {} {}",
            format!("0x{:04X}", chip.project_id).bright_cyan(),
            chip.name
        );
    }
}

fn choose_port(config: &PpmBootConfig) -> String {
    if let Some(port) = &config.port {
        return port.clone();
    }
    let ports = serialport::available_ports().expect("list serial ports");
    let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
    names.sort();
    Select::new("select the serial port the PPM adapter is attached to", names)
        .prompt()
        .expect("select serial port")
}

fn run_action(action: MemoryAction, kind: Action) {
    let mut config = PpmBootConfig::load();

    let port = action.port.clone().unwrap_or_else(|| choose_port(&config));
    let bitrate = action.bitrate.unwrap_or(config.bitrate);
    let manual_power = action.manual_power || config.manual_power;

    let hex_source = fs::read_to_string(&action.hex).expect("read HEX image file");
    let hex = HexImage::parse(&hex_source).expect("parse HEX image");

    let serial = serialport::new(&port, 115_200)
        .timeout(Duration::from_millis(250))
        .open()
        .expect("open serial port");
    let serial: SharedSerial = Rc::new(RefCell::new(serial));

    let mut driver = LineDriver::new(SerialPpmLine {
        serial: serial.clone(),
    });
    let mut power = AdapterPower { serial };

    println!(
        "{}",
        format!(
            "entering PPM programming mode on {port} @ {bitrate} bps..."
        )
        .cyan()
    );

    let code = orchestrator::do_action(
        &mut driver,
        &mut power,
        manual_power,
        action.broadcast,
        bitrate,
        action.memory.into(),
        kind,
        &hex,
    );

    match code {
        ErrorCode::Ok => {
            println!("{}", "done.".green().bold());
            config.port = Some(port);
            config.bitrate = bitrate;
            config.manual_power = manual_power;
            let _ = config.save();
        }
        other => {
            eprintln!(
                "{}",
                format!("failed: {} ({})", other.message(), other.code()).red()
            );
            std::process::exit(1);
        }
    }
}

/// A serial port handle shared between the [`PlatformLine`] adapter and the
/// [`PowerControl`] adapter, which otherwise can't both hold it.
type SharedSerial = Rc<RefCell<Box<dyn SerialPort>>>;

const OP_CONFIGURE: u8 = 1;
const OP_TRANSMIT: u8 = 2;
const OP_RECEIVE: u8 = 3;

const STATUS_OK: u8 = 0;
const STATUS_NONE: u8 = 1;

/// Drives a serial-attached PPM adapter: a small companion microcontroller
/// that owns the GPIO capture/generate peripheral and speaks a minimal
/// framed request/response protocol over UART, analogous in shape to the
/// command/response framing this family's other tools use to talk to an ISP
/// bootloader, carrying PPM symbol timings instead of flash commands.
struct SerialPpmLine {
    serial: SharedSerial,
}

fn write_packet(serial: &mut dyn SerialPort, opcode: u8, payload: &[u8]) -> io::Result<()> {
    let mut packet = Vec::with_capacity(3 + payload.len());
    packet.write_u8(opcode)?;
    packet.write_u16::<LittleEndian>(payload.len() as u16)?;
    packet.extend_from_slice(payload);
    serial.write_all(&packet)
}

fn read_response(serial: &mut dyn SerialPort) -> io::Result<(u8, Vec<u8>)> {
    let status = serial.read_u8()?;
    let len = serial.read_u16::<LittleEndian>()? as usize;
    let mut payload = vec![0u8; len];
    serial.read_exact(&mut payload)?;
    Ok((status, payload))
}

impl PlatformLine for SerialPpmLine {
    fn configure(&mut self, timing: ppm_boot::codec::LineTiming) -> Result<(), LineError> {
        let mut payload = Vec::with_capacity(12);
        payload
            .write_u32::<LittleEndian>(timing.resolution_hz)
            .unwrap();
        payload.write_u32::<LittleEndian>(timing.rx_min_ns).unwrap();
        payload.write_u32::<LittleEndian>(timing.rx_max_ns).unwrap();

        let mut serial = self.serial.borrow_mut();
        serial
            .set_timeout(Duration::from_millis(500))
            .map_err(|e| LineError::Configure(e.to_string()))?;
        write_packet(&mut *serial, OP_CONFIGURE, &payload)
            .map_err(|e| LineError::Configure(e.to_string()))?;
        read_response(&mut *serial).map_err(|e| LineError::Configure(e.to_string()))?;
        Ok(())
    }

    fn transmit_blocking(&mut self, symbols: &[u32]) -> Result<(), LineError> {
        let mut payload = Vec::with_capacity(4 + symbols.len() * 4);
        payload
            .write_u32::<LittleEndian>(symbols.len() as u32)
            .unwrap();
        for &symbol in symbols {
            payload.write_u32::<LittleEndian>(symbol).unwrap();
        }

        let mut serial = self.serial.borrow_mut();
        serial
            .set_timeout(Duration::from_secs(2))
            .map_err(|e| LineError::Transmit(e.to_string()))?;
        write_packet(&mut *serial, OP_TRANSMIT, &payload)
            .map_err(|e| LineError::Transmit(e.to_string()))?;
        read_response(&mut *serial).map_err(|e| LineError::Transmit(e.to_string()))?;
        Ok(())
    }

    fn receive_blocking(&mut self, timeout_us: u32) -> Result<Option<Vec<u32>>, LineError> {
        let mut payload = Vec::with_capacity(4);
        payload.write_u32::<LittleEndian>(timeout_us).unwrap();

        let mut serial = self.serial.borrow_mut();
        let slack = Duration::from_millis(250);
        serial
            .set_timeout(Duration::from_micros(timeout_us as u64) + slack)
            .map_err(|e| LineError::Receive(e.to_string()))?;
        write_packet(&mut *serial, OP_RECEIVE, &payload)
            .map_err(|e| LineError::Receive(e.to_string()))?;
        let (status, body) = read_response(&mut *serial).map_err(|e| LineError::Receive(e.to_string()))?;

        if status == STATUS_NONE {
            return Ok(None);
        }
        debug_assert_eq!(status, STATUS_OK);
        let mut cursor = io::Cursor::new(body);
        let count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| LineError::Receive(e.to_string()))? as usize;
        let mut symbols = Vec::with_capacity(count);
        for _ in 0..count {
            symbols.push(
                cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| LineError::Receive(e.to_string()))?,
            );
        }
        Ok(Some(symbols))
    }
}

/// Host power-cycling via the adapter's DTR line, wired to the target's
/// power switch -- the same technique flashing tools commonly use to pulse
/// a target's reset/boot pins without a dedicated GPIO.
struct AdapterPower {
    serial: SharedSerial,
}

impl PowerControl for AdapterPower {
    fn is_powered(&self) -> bool {
        true
    }

    fn power_down_for(&mut self, ms: u32) -> Result<(), ppm_boot::Error> {
        let mut serial = self.serial.borrow_mut();
        serial
            .write_data_terminal_ready(false)
            .map_err(|e| ppm_boot::Error::InvalidArg(e.to_string()))?;
        drop(serial);
        std::thread::sleep(Duration::from_millis(ms as u64));
        self.serial
            .borrow_mut()
            .write_data_terminal_ready(true)
            .map_err(|e| ppm_boot::Error::InvalidArg(e.to_string()))?;
        Ok(())
    }
}
