use std::fs;
use std::process::ExitCode;

use jflash::{BitstreamFile, DeviceSequencer, JedecFile, Programmer, SvfPlayer};

mod cli;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = cli::parse();

    match run(&args) {
        Ok(()) => ExitCode::from(0),
        Err(RunError::NoDevice) => {
            eprintln!("error: no programmer device found");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: &cli::Args) -> Result<(), RunError> {
    let programmer = match &args.port {
        Some(name) => Programmer::open(name),
        None => Programmer::find(),
    }
    .map_err(RunError::from_find)?;

    let mut jtag = jflash::JtagOps::new(programmer);

    if let Some(path) = &args.svf {
        let text = fs::read_to_string(path)?;
        let mut player = SvfPlayer::new(&mut jtag);
        player.play(&text)?;
        return Ok(());
    }

    let text_or_bytes = fs::read(&args.file)?;
    let mut sequencer = DeviceSequencer::new(jtag);
    let progress = cli::render_progress(args.quiet);

    if args.bitstream {
        let fuses = BitstreamFile::from_bytes(&text_or_bytes);
        sequencer.program(&fuses, progress)?;
    } else {
        let text = String::from_utf8_lossy(&text_or_bytes);
        let fuses = JedecFile::parse(&text)?;
        sequencer.program(&fuses, progress)?;
    }

    Ok(())
}

/// Thin wrapper distinguishing "no device found" (exit code 1, spec.md
/// §6) from every other failure (exit code 2).
enum RunError {
    NoDevice,
    Other(jflash::JflashError),
}

impl RunError {
    fn from_find(e: failure::Error) -> Self {
        if e.downcast_ref::<jflash::JflashError>()
            .map(|e| matches!(e, jflash::JflashError::NoDeviceFound | jflash::JflashError::DeviceNotFound))
            .unwrap_or(false)
        {
            RunError::NoDevice
        } else {
            RunError::Other(jflash::JflashError::ProtocolViolation(e.to_string()))
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::NoDevice => write!(f, "no programmer device found"),
            RunError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl From<failure::Error> for RunError {
    fn from(e: failure::Error) -> Self {
        RunError::from_find(e)
    }
}

impl From<jflash::JflashError> for RunError {
    fn from(e: jflash::JflashError) -> Self {
        match e {
            jflash::JflashError::NoDeviceFound | jflash::JflashError::DeviceNotFound => RunError::NoDevice,
            other => RunError::Other(other),
        }
    }
}

impl From<std::io::Error> for RunError {
    fn from(e: std::io::Error) -> Self {
        RunError::Other(jflash::JflashError::Transport(e))
    }
}
