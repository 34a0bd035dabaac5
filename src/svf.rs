//! A minimal SVF (Serial Vector Format) playback path, secondary to the
//! SIE-accelerated flow in `sequencer`. Grounded on `JtagSvfParser` in
//! `original_source/python/{tinyfpgaa.py,usb_gpio.py}`: it covers the
//! commands that parser actually exercises (`SIR`/`SDR`/`STATE`/
//! `RUNTEST`/`LOOP`/`ENDLOOP`/`ENDIR`/`ENDDR`), not the full SVF grammar.
//! `HDR`/`HIR`/`TDR`/`TIR` header/trailer declarations are recognized but
//! not applied, matching the reference parser's own handling of them as
//! bookkeeping it never actually shifts.

use std::io::{Read, Write};

use crate::jtag_ops::JtagOps;
use crate::jtag_tap::TapState;
use crate::serial_link::BytesAvailable;
use crate::{JflashError, Result};

fn parse_state(name: &str) -> Option<TapState> {
    Some(match name {
        "reset" => TapState::Reset,
        "idle" => TapState::Idle,
        "drselect" => TapState::DrSelect,
        "drcapture" => TapState::DrCapture,
        "drshift" => TapState::DrShift,
        "drexit1" => TapState::DrExit1,
        "drpause" => TapState::DrPause,
        "drexit2" => TapState::DrExit2,
        "drupdate" => TapState::DrUpdate,
        "irselect" => TapState::IrSelect,
        "ircapture" => TapState::IrCapture,
        "irshift" => TapState::IrShift,
        "irexit1" => TapState::IrExit1,
        "irpause" => TapState::IrPause,
        "irexit2" => TapState::IrExit2,
        "irupdate" => TapState::IrUpdate,
        _ => return None,
    })
}

/// Splits SVF text into lowercase, comment-stripped, whitespace-tokenized
/// statements (`!`-to-end-of-line comments, `;`-terminated statements,
/// parentheses dropped), mirroring the regex pipeline in
/// `JtagSvfParser.run`.
fn tokenize(text: &str) -> Vec<Vec<String>> {
    let mut stripped = String::with_capacity(text.len());
    for line in text.lines() {
        stripped.push_str(line.split('!').next().unwrap_or(""));
        stripped.push(' ');
    }

    stripped
        .to_lowercase()
        .split(';')
        .map(|stmt| {
            stmt.replace(['(', ')'], " ")
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|tokens| !tokens.is_empty())
        .collect()
}

/// Finds the value following a `name` keyword, e.g. `tdi` in
/// `sdr 32 tdi 00000000 tdo 00000000 mask ffffffff`. Mirrors the
/// reference parser's `field()`, which scans every adjacent token pair
/// for one whose first element matches `name`.
fn field<'t>(tokens: &'t [String], name: &str) -> Option<&'t str> {
    tokens.windows(2).find(|w| w[0] == name).map(|w| w[1].as_str())
}

/// Finds the value *preceding* a `name` unit keyword, e.g. the `10` in
/// `runtest idle 10 tck`. Mirrors the reference parser's
/// `runtest_field()`, whose pair order is reversed from `field()`'s.
fn unit_field<'t>(tokens: &'t [String], name: &str) -> Option<&'t str> {
    tokens.windows(2).find(|w| w[1] == name).map(|w| w[0].as_str())
}

fn hex_field(tokens: &[String], name: &str) -> Option<u128> {
    field(tokens, name).and_then(|h| u128::from_str_radix(h, 16).ok())
}

/// Replays a parsed SVF script against a `JtagOps` session.
pub struct SvfPlayer<'a, T: Read + Write + BytesAvailable> {
    jtag: &'a mut JtagOps<T>,
}

impl<'a, T: Read + Write + BytesAvailable> SvfPlayer<'a, T> {
    pub fn new(jtag: &'a mut JtagOps<T>) -> Self {
        SvfPlayer { jtag }
    }

    /// Parse and execute `text` end to end.
    pub fn play(&mut self, text: &str) -> Result<()> {
        let cmds = tokenize(text);
        let mut i = 0usize;
        let mut loop_start: Option<usize> = None;
        let mut loop_remaining: u32 = 0;

        while i < cmds.len() {
            let cmd = &cmds[i];
            i += 1;

            match cmd[0].as_str() {
                "loop" => {
                    loop_remaining = cmd.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
                    loop_start = Some(i);
                }
                "endloop" => {
                    if let Some(start) = loop_start {
                        if loop_remaining > 1 {
                            loop_remaining -= 1;
                            i = start;
                        } else {
                            loop_start = None;
                        }
                    }
                }
                _ => self.exec(cmd)?,
            }
        }

        Ok(())
    }

    fn exec(&mut self, tokens: &[String]) -> Result<()> {
        match tokens[0].as_str() {
            "sir" => {
                let num_bits = Self::num_bits(tokens)?;
                let data = hex_field(tokens, "tdi").unwrap_or(0);
                self.jtag.write_ir(num_bits, data)
            }
            "sdr" => {
                let num_bits = Self::num_bits(tokens)?;
                if let Some(expected) = hex_field(tokens, "tdo") {
                    let mask = hex_field(tokens, "mask").unwrap_or_else(|| {
                        if num_bits >= 128 {
                            u128::MAX
                        } else {
                            (1u128 << num_bits) - 1
                        }
                    });
                    self.jtag.check_dr(num_bits, expected, mask)
                } else {
                    let data = hex_field(tokens, "tdi").unwrap_or(0);
                    self.jtag.write_dr(num_bits, data)
                }
            }
            "state" => {
                if let Some(state) = tokens.get(1).and_then(|s| parse_state(s)) {
                    self.jtag.goto_state(state)?;
                }
                Ok(())
            }
            "runtest" => {
                let clks: u32 = unit_field(tokens, "tck").and_then(|s| s.parse().ok()).unwrap_or(0);
                let state = tokens.get(1).and_then(|s| parse_state(s)).unwrap_or(TapState::Idle);
                self.jtag.runtest(clks, state)
            }
            // Header/trailer/end-state bookkeeping the reference parser
            // records but never actually shifts through the TAP.
            "hdr" | "hir" | "tdr" | "tir" | "enddr" | "endir" | "trst" | "frequency" => Ok(()),
            _ => Ok(()),
        }
    }

    fn num_bits(tokens: &[String]) -> Result<usize> {
        tokens
            .get(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| JflashError::ProtocolViolation(format!("malformed SVF command: {:?}", tokens)).into())
    }
}
