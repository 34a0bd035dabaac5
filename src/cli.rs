//! Argument parsing and progress rendering for the `jflash` binary.
//!
//! The flag set is `clap`'s builder API in the teacher's style (the
//! dependency was already declared in `software/Cargo.toml` but unused by
//! its `main.rs`); this is the first thing in the crate that actually
//! wires it up.

use clap::{App, Arg, ArgMatches};

use jflash::ProgressEvent;

pub struct Args {
    pub file: String,
    pub quiet: bool,
    pub port: Option<String>,
    pub bitstream: bool,
    pub svf: Option<String>,
}

pub fn parse() -> Args {
    from_matches(app().get_matches())
}

fn app() -> App<'static, 'static> {
    App::new("jflash")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Program ECP5-family FPGAs over a JTAG-driving USB-serial helper board")
        .arg(
            Arg::with_name("file")
                .index(1)
                .required_unless("svf")
                .help("JEDEC (.jed) file to program"),
        )
        .arg(Arg::with_name("quiet").long("quiet").short("q").help("Suppress progress output"))
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .value_name("NAME")
                .help("Serial port to use, bypassing VID:PID discovery"),
        )
        .arg(
            Arg::with_name("bitstream")
                .long("bitstream")
                .help("Treat FILE as a raw row-chunked bitstream instead of JEDEC text"),
        )
        .arg(
            Arg::with_name("svf")
                .long("svf")
                .takes_value(true)
                .value_name("FILE")
                .conflicts_with("file")
                .help("Replay an SVF script instead of running the ECP5 program sequence"),
        )
}

fn from_matches(matches: ArgMatches<'_>) -> Args {
    Args {
        file: matches.value_of("file").unwrap_or_default().to_string(),
        quiet: matches.is_present("quiet"),
        port: matches.value_of("port").map(str::to_string),
        bitstream: matches.is_present("bitstream"),
        svf: matches.value_of("svf").map(str::to_string),
    }
}

/// Renders `DeviceSequencer::program`'s progress callback to stdout,
/// matching the teacher's direct-`println!` style in `main.rs`. A no-op
/// closure is used instead when `--quiet` is given.
pub fn render_progress(quiet: bool) -> impl FnMut(ProgressEvent) {
    move |event| {
        if quiet {
            return;
        }
        match event {
            ProgressEvent::Phase(name) => println!("==> {}", name),
            ProgressEvent::Rows(n) => println!("    {} rows", n),
            ProgressEvent::Failed(reason) => eprintln!("!!! {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_file_argument() {
        let matches = app().get_matches_from(vec!["jflash", "design.jed"]);
        let args = from_matches(matches);
        assert_eq!(args.file, "design.jed");
        assert!(!args.quiet);
        assert!(args.port.is_none());
        assert!(!args.bitstream);
        assert!(args.svf.is_none());
    }

    #[test]
    fn parses_port_and_bitstream_flags() {
        let matches = app().get_matches_from(vec!["jflash", "--port", "/dev/ttyACM0", "--bitstream", "design.bit"]);
        let args = from_matches(matches);
        assert_eq!(args.port.as_deref(), Some("/dev/ttyACM0"));
        assert!(args.bitstream);
    }

    #[test]
    fn parses_svf_flag_in_place_of_file() {
        let matches = app().get_matches_from(vec!["jflash", "--svf", "script.svf"]);
        let args = from_matches(matches);
        assert_eq!(args.svf.as_deref(), Some("script.svf"));
    }
}
