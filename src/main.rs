use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use stcisp::error::{Error, Result};
use stcisp::flashing::{Flashing, PowerCycle, Progress, SessionConfig};
use stcisp::options;
use stcisp::protocol::ProtocolKind;
use stcisp::transport::{ResetLine, SerialTransport, Transport, UsbTransport};

/// stcisp - an STC MCU ISP flash tool
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Code segment file to flash (BIN/HEX)
    code_image: Option<PathBuf>,

    /// EEPROM segment file to flash (BIN/HEX)
    eeprom_image: Option<PathBuf>,

    /// Cycle power automatically by asserting the reset line
    #[arg(short = 'a', long)]
    autoreset: bool,

    /// Modem control line used for power-cycling
    #[arg(short = 'A', value_enum, default_value = "dtr")]
    resetline: ResetLineArg,

    /// Shell command for board power-cycling (instead of line assertion)
    #[arg(short = 'r', long)]
    resetcmd: Option<String>,

    /// Protocol version
    #[arg(short = 'P', long, value_enum, default_value = "auto")]
    protocol: ProtocolArg,

    /// Serial port device
    #[arg(short = 'p', long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Transfer baud rate
    #[arg(short = 'b', long, default_value_t = 19200)]
    baud: u32,

    /// Handshake baud rate
    #[arg(short = 'l', long, default_value_t = 2400)]
    handshake: u32,

    /// Set option (can be used multiple times, see documentation)
    #[arg(short = 'o', long = "option", value_name = "KEY=VAL")]
    option: Vec<String>,

    /// RC oscillator frequency in kHz (STC15+ series only)
    #[arg(short = 't', long, default_value_t = 0.0)]
    trim: f64,

    /// Enable debug output
    #[arg(short = 'D', long)]
    debug: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ProtocolArg {
    Stc89,
    Stc12a,
    Stc12b,
    Stc12,
    Stc15a,
    Stc15,
    Stc8,
    Usb15,
    Auto,
}

impl From<ProtocolArg> for ProtocolKind {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Stc89 => ProtocolKind::Stc89,
            ProtocolArg::Stc12a => ProtocolKind::Stc12A,
            ProtocolArg::Stc12b => ProtocolKind::Stc12B,
            ProtocolArg::Stc12 => ProtocolKind::Stc12,
            ProtocolArg::Stc15a => ProtocolKind::Stc15A,
            ProtocolArg::Stc15 => ProtocolKind::Stc15,
            ProtocolArg::Stc8 => ProtocolKind::Stc8,
            ProtocolArg::Usb15 => ProtocolKind::Usb15,
            ProtocolArg::Auto => ProtocolKind::Auto,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ResetLineArg {
    Dtr,
    Rts,
}

/// Progress rendering on the terminal; one bar per write phase.
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl Progress for BarProgress {
    fn on_phase(&mut self, _phase: &str) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn on_bytes(&mut self, written: usize, total: usize) {
        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {bytes}/{total_bytes}")
                    .expect("static template"),
            );
            bar
        });
        bar.set_position(written as u64);
    }
}

fn parse_options(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|opt| match opt.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(Error::BadOption(format!(
                "'{}' is not of the form KEY=VAL",
                opt
            ))),
        })
        .collect()
}

fn run(cli: &Cli) -> Result<()> {
    let protocol = ProtocolKind::from(cli.protocol);
    let pairs = parse_options(&cli.option)?;

    // options are checked against the registries before the port is even
    // opened; under -P auto the concrete dialect re-validates later
    for (name, value) in &pairs {
        if protocol == ProtocolKind::Auto {
            options::preflight_any(name, value)?;
        } else {
            options::preflight(protocol, name, value)?;
        }
    }

    let transport: Box<dyn Transport> = if protocol == ProtocolKind::Usb15 {
        log::info!("Waiting for USB bootloader, please cycle power");
        Box::new(UsbTransport::wait_and_open(Duration::from_secs(30))?)
    } else {
        let line = match cli.resetline {
            ResetLineArg::Dtr => ResetLine::Dtr,
            ResetLineArg::Rts => ResetLine::Rts,
        };
        Box::new(SerialTransport::open(&cli.port, cli.handshake, line)?)
    };

    let power_cycle = if let Some(cmd) = &cli.resetcmd {
        Some(PowerCycle::Command(cmd.clone()))
    } else if cli.autoreset {
        Some(PowerCycle::Line(Duration::from_millis(500)))
    } else {
        None
    };

    let config = SessionConfig {
        protocol,
        handshake_baud: cli.handshake,
        transfer_baud: cli.baud,
        trim_khz: cli.trim,
        power_cycle,
    };

    let mut session = Flashing::new(transport, config, Box::new(BarProgress { bar: None }));
    session.run(
        cli.code_image.as_deref(),
        cli.eeprom_image.as_deref(),
        &pairs,
    )
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Err(e) = ctrlc::set_handler(stcisp::flashing::request_abort) {
        log::warn!("cannot install interrupt handler: {}", e);
    }

    match run(&cli) {
        Ok(()) => {}
        Err(e) => {
            if matches!(e, Error::UserAbort) {
                log::error!("interrupted");
            }
            exit(e.exit_code());
        }
    }
}
