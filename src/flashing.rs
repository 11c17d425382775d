//! The programming session: power-cycle, identify, trim, baud switch,
//! erase, program, options, disconnect.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::format;
use crate::protocol::{
    autodetect, await_announcement, build_engine, revalidate_announcement, Engine, Link,
    ProtocolKind, CONNECT_DEADLINE,
};
use crate::transport::Transport;

/// Progress callbacks emitted by the core; the CLI renders them. Rendering
/// must never block transport reads.
pub trait Progress {
    fn on_phase(&mut self, phase: &str);
    fn on_bytes(&mut self, written: usize, total: usize);
}

pub struct NullProgress;

impl Progress for NullProgress {
    fn on_phase(&mut self, _phase: &str) {}
    fn on_bytes(&mut self, _written: usize, _total: usize) {}
}

static INTERRUPT: AtomicBool = AtomicBool::new(false);

/// Request a best-effort disconnect at the next suspension point. Safe to
/// call from a signal handler thread.
pub fn request_abort() {
    INTERRUPT.store(true, Ordering::SeqCst);
}

pub(crate) fn interrupted() -> bool {
    INTERRUPT.load(Ordering::SeqCst)
}

fn check_abort() -> Result<()> {
    if interrupted() {
        Err(Error::UserAbort)
    } else {
        Ok(())
    }
}

/// How to power-cycle the target board. The core does not interpret the
/// shell command; it only runs it.
pub enum PowerCycle {
    /// Assert the transport's reset line for the given duration.
    Line(Duration),
    /// Run an external command.
    Command(String),
}

impl PowerCycle {
    fn run(&self, transport: &mut dyn Transport) -> Result<()> {
        match self {
            PowerCycle::Line(duration) => {
                log::info!("Cycling power");
                transport.assert_reset(*duration)?;
            }
            PowerCycle::Command(cmd) => {
                log::info!("Cycling power via shell command: {}", cmd);
                #[cfg(windows)]
                let status = std::process::Command::new("cmd").arg("/C").arg(cmd).status()?;
                #[cfg(not(windows))]
                let status = std::process::Command::new("sh").arg("-c").arg(cmd).status()?;
                if !status.success() {
                    log::warn!("reset command exited with {}", status);
                }
            }
        }
        Ok(())
    }
}

pub struct SessionConfig {
    pub protocol: ProtocolKind,
    pub handshake_baud: u32,
    pub transfer_baud: u32,
    pub trim_khz: f64,
    pub power_cycle: Option<PowerCycle>,
}

/// Top-level orchestrator over one transport and one dialect engine.
pub struct Flashing {
    link: Link,
    engine: Option<Box<dyn Engine>>,
    config: SessionConfig,
    progress: Box<dyn Progress>,
    stage: &'static str,
}

impl Flashing {
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig, progress: Box<dyn Progress>) -> Self {
        Flashing {
            link: Link::new(transport),
            engine: None,
            config,
            progress,
            stage: "connect",
        }
    }

    /// What identify learned about the target, once connected.
    pub fn target(&self) -> Option<&crate::protocol::TargetState> {
        self.engine.as_ref().map(|engine| engine.state())
    }

    /// Run the whole session. On failure a best-effort disconnect is
    /// attempted and the error propagates to the caller.
    pub fn run(
        &mut self,
        code_path: Option<&Path>,
        eeprom_path: Option<&Path>,
        options: &[(String, String)],
    ) -> Result<()> {
        match self.execute(code_path, eeprom_path, options) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("{} failed: {}", self.stage, err);
                if let Some(engine) = self.engine.as_mut() {
                    // best effort; the device may be long gone
                    let _ = engine.terminate(&mut self.link);
                }
                Err(err)
            }
        }
    }

    fn execute(
        &mut self,
        code_path: Option<&Path>,
        eeprom_path: Option<&Path>,
        options: &[(String, String)],
    ) -> Result<()> {
        if self.config.protocol != ProtocolKind::Usb15
            && self.config.transfer_baud < self.config.handshake_baud
        {
            return Err(Error::Protocol(
                "transfer baud rate is below the handshake baud rate".into(),
            ));
        }

        self.stage = "connect";
        self.progress.on_phase("connect");
        self.connect()?;

        let engine = self.engine.as_mut().expect("connected");
        engine.describe();

        if self.config.trim_khz > 0.0 && !engine.supports_trim() {
            return Err(Error::Unsupported("frequency trim"));
        }

        self.stage = "options";
        let engine = self.engine.as_mut().expect("connected");
        for (name, value) in options {
            log::info!("Option {}={}", name, value);
            match engine.options_mut() {
                Some(opts) => opts.set(name, value)?,
                None => return Err(Error::BadOption(format!("unknown option '{}'", name))),
            }
        }
        if let Some(opts) = engine.options() {
            opts.validate()?;
        }

        let code_path = match code_path {
            Some(path) => path,
            None => {
                // identify-only run
                self.stage = "disconnect";
                let engine = self.engine.as_mut().expect("connected");
                return engine.terminate(&mut self.link);
            }
        };

        self.stage = "load image";
        let engine = self.engine.as_mut().expect("connected");
        let model = engine.state().model()?.clone();
        let block = engine.block_size();
        let eeprom_base = engine.eeprom_base()?;
        let eeprom_limit = if model.iap && model.eeprom == 0 {
            model.total as usize - eeprom_base
        } else {
            model.eeprom as usize
        };

        log::info!("Loading code image");
        let code = format::pad_to_block(format::load_image(code_path, eeprom_base)?, block);
        let eeprom = match eeprom_path {
            Some(path) => {
                log::info!("Loading EEPROM image");
                format::pad_to_block(format::load_image(path, eeprom_limit)?, block)
            }
            None => vec![],
        };
        check_abort()?;

        self.stage = "handshake";
        self.progress.on_phase("handshake");
        self.handshake_with_retry()?;
        check_abort()?;

        self.stage = "erase";
        self.progress.on_phase("erase");
        let engine = self.engine.as_mut().expect("connected");
        engine.erase(&mut self.link, code.len() + eeprom.len(), eeprom_base)?;
        check_abort()?;

        self.stage = "write code";
        self.progress.on_phase("write code");
        log::info!("Writing {} bytes of code flash", code.len());
        let engine = self.engine.as_mut().expect("connected");
        engine.write_blocks(&mut self.link, 0, &code, true, self.progress.as_mut())?;

        if !eeprom.is_empty() {
            self.stage = "write eeprom";
            self.progress.on_phase("write eeprom");
            log::info!("Writing {} bytes of EEPROM", eeprom.len());
            let engine = self.engine.as_mut().expect("connected");
            engine.write_blocks(
                &mut self.link,
                eeprom_base,
                &eeprom,
                code.is_empty(),
                self.progress.as_mut(),
            )?;
        }
        let engine = self.engine.as_mut().expect("connected");
        engine.finish_write(&mut self.link)?;
        check_abort()?;

        self.stage = "options";
        self.progress.on_phase("options");
        let engine = self.engine.as_mut().expect("connected");
        engine.write_options(&mut self.link)?;

        self.stage = "disconnect";
        self.progress.on_phase("disconnect");
        let engine = self.engine.as_mut().expect("connected");
        engine.terminate(&mut self.link)
    }

    fn connect(&mut self) -> Result<()> {
        match self.config.protocol {
            ProtocolKind::Usb15 => self.connect_usb(),
            ProtocolKind::Auto => self.connect_auto(),
            kind => self.connect_serial(kind),
        }
    }

    fn connect_serial(&mut self, kind: ProtocolKind) -> Result<()> {
        let mut engine = build_engine(
            kind,
            self.config.handshake_baud,
            self.config.transfer_baud,
            self.config.trim_khz,
        )?;
        self.link.set_codec(engine.codec());
        self.link.transport().set_parity(engine.parity())?;
        self.link.transport().set_baud(self.config.handshake_baud)?;
        self.link.transport().drain()?;

        self.power_cycle()?;
        let status = await_announcement(&mut self.link, &mut |link| engine.read_status(link))?;
        engine.initialize(&status)?;
        self.engine = Some(engine);
        Ok(())
    }

    fn connect_auto(&mut self) -> Result<()> {
        self.link.transport().set_parity(crate::transport::Parity::Even)?;
        self.link.transport().set_baud(self.config.handshake_baud)?;
        self.link.transport().drain()?;

        self.power_cycle()?;
        let (kind, raw_status) = autodetect::detect(&mut self.link)?;

        let mut engine = build_engine(
            kind,
            self.config.handshake_baud,
            self.config.transfer_baud,
            self.config.trim_khz,
        )?;
        self.link.set_codec(engine.codec());
        self.link.transport().set_parity(engine.parity())?;
        let status = revalidate_announcement(engine.codec(), &raw_status)?;
        engine.initialize(&status)?;
        self.engine = Some(engine);
        Ok(())
    }

    fn connect_usb(&mut self) -> Result<()> {
        let mut engine = build_engine(
            ProtocolKind::Usb15,
            self.config.handshake_baud,
            self.config.transfer_baud,
            self.config.trim_khz,
        )?;
        log::info!("Waiting for MCU, please cycle power");
        let start = Instant::now();
        let status = loop {
            check_abort()?;
            match engine.read_status(&mut self.link) {
                Ok(status) if status.len() >= 38 => break status,
                Ok(_)
                | Err(Error::Frame(_))
                | Err(Error::Timeout)
                | Err(Error::LinkLost(_))
                | Err(Error::Protocol(_)) => {
                    if start.elapsed() > CONNECT_DEADLINE {
                        return Err(Error::LinkLost(
                            "no power-up announcement from target".into(),
                        ));
                    }
                    sleep(Duration::from_millis(500));
                }
                Err(e) => return Err(e),
            }
        };
        engine.initialize(&status)?;
        self.engine = Some(engine);
        Ok(())
    }

    fn power_cycle(&mut self) -> Result<()> {
        match &self.config.power_cycle {
            Some(cycle) => cycle.run(self.link.transport()),
            None => {
                log::info!("Waiting for MCU, please cycle power");
                Ok(())
            }
        }
    }

    /// Handshake retry policy: framing errors on the synchronization frames
    /// are retried up to three times at the handshake baud; a lost link
    /// during the baud switch gets exactly one fallback at half the
    /// proposed transfer baud.
    fn handshake_with_retry(&mut self) -> Result<()> {
        let engine = self.engine.as_mut().expect("connected");
        let mut frame_retries = 0;
        let mut fallback_done = false;
        loop {
            match engine.handshake(&mut self.link) {
                Ok(()) => return Ok(()),
                Err(Error::Frame(e)) if frame_retries < 3 => {
                    frame_retries += 1;
                    log::warn!("handshake framing error ({}), retrying", e);
                    self.link.transport().set_baud(self.config.handshake_baud)?;
                }
                Err(Error::LinkLost(_))
                    if !fallback_done && engine.transfer_baud() / 2 >= self.config.handshake_baud =>
                {
                    fallback_done = true;
                    let halved = engine.transfer_baud() / 2;
                    log::warn!("link lost during baud switch, retrying at {} baud", halved);
                    engine.set_transfer_baud(halved);
                    self.link.transport().set_baud(self.config.handshake_baud)?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
