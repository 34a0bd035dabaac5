//! TAP-level JTAG operations built on top of `Programmer`'s SIE shifts and
//! `TapTracker`'s shortest-path navigation: `write_ir`, `read_dr`,
//! `write_dr`, `check_dr`, `runtest`, and loop bracketing.
//!
//! Every operation that returns data blocks until the bytes arrive
//! (spec.md §4.9's design note (b), "synchronous RPC style") rather than
//! threading callbacks up through this layer — `SerialLink`'s FIFO queue
//! is still exercised directly by `Programmer` and by its own tests, but
//! at this layer a blocking read is simpler and no less correct, since
//! every call here is already a synchronous round trip.

use std::io::{Read, Write};

use crate::jtag_tap::{TapState, TapTracker};
use crate::programmer::{sie, Programmer};
use crate::serial_link::BytesAvailable;
use crate::{JflashError, Result};

/// Maximum TCK pulses per `run_tck` command, matching the firmware's
/// single-byte pulse-count field (spec.md §4.7).
const MAX_RUNTEST_CHUNK: u32 = 1000;

/// Combines the byte-protocol encoder with TAP state tracking so callers
/// can issue IR/DR shifts by name instead of hand-building TMS routes.
pub struct JtagOps<T: Read + Write + BytesAvailable> {
    programmer: Programmer<T>,
    tracker: TapTracker,
}

impl<T: Read + Write + BytesAvailable> JtagOps<T> {
    pub fn new(programmer: Programmer<T>) -> Self {
        JtagOps { programmer, tracker: TapTracker::new() }
    }

    pub fn programmer_mut(&mut self) -> &mut Programmer<T> {
        &mut self.programmer
    }

    pub fn tap_state(&self) -> Option<TapState> {
        self.tracker.current()
    }

    /// Route the TAP to an arbitrary state, for callers outside this
    /// module (the SVF `STATE` command) that don't go through one of
    /// the named shift operations.
    pub fn goto_state(&mut self, target: TapState) -> Result<()> {
        self.goto(target)
    }

    /// Route the TAP to `target`, shifting the resulting TMS sequence
    /// through SIE slot 1 (bit `i` of `data` is TMS pulse `i`).
    fn goto(&mut self, target: TapState) -> Result<()> {
        let tms_seq = self.tracker.route_to(target);
        if tms_seq.is_empty() {
            return Ok(());
        }
        if tms_seq.len() > 128 {
            return Err(JflashError::ProtocolViolation(
                "TMS route exceeds the 128-bit shift payload".into(),
            )
            .into());
        }
        let mut data: u128 = 0;
        for (i, &bit) in tms_seq.iter().enumerate() {
            if bit {
                data |= 1 << i;
            }
        }
        self.programmer.shift(sie::SHIFT_TMS, tms_seq.len(), data, 0, false, None, None)
    }

    /// Shift `num_bits` of `data` into IR, then return to IRPAUSE.
    /// The shift's last-phase overlay advances the TAP from IRSHIFT to
    /// IREXIT1 in hardware; the tracker is updated to match before the
    /// final `goto` (spec.md §4.7 edge-case policy).
    pub fn write_ir(&mut self, num_bits: usize, data: u128) -> Result<()> {
        self.goto(TapState::IrShift)?;
        if num_bits > 0 {
            self.programmer.shift(sie::SHIFT_TDI, num_bits, data, 0, false, None, None)?;
            self.tracker.set_current(TapState::IrExit1);
        }
        self.goto(TapState::IrPause)
    }

    /// Shift `num_bits` of `data` into DR, then return to DRPAUSE.
    pub fn write_dr(&mut self, num_bits: usize, data: u128) -> Result<()> {
        self.goto(TapState::DrShift)?;
        if num_bits > 0 {
            self.programmer.shift(sie::SHIFT_TDI, num_bits, data, 0, false, None, None)?;
            self.tracker.set_current(TapState::DrExit1);
        }
        self.goto(TapState::DrPause)
    }

    /// Like `write_dr`, for payloads wider than 128 bits (the boundary
    /// scan register write is the only caller that needs this).
    pub fn write_dr_wide(&mut self, num_bits: usize, data: &[u8]) -> Result<()> {
        self.goto(TapState::DrShift)?;
        if num_bits > 0 {
            self.programmer.shift_wide(sie::SHIFT_TDI, num_bits, data)?;
            self.tracker.set_current(TapState::DrExit1);
        }
        self.goto(TapState::DrPause)
    }

    /// Shift `num_bits` out of DR and return the little-endian sampled
    /// value, then return to DRPAUSE.
    pub fn read_dr(&mut self, num_bits: usize) -> Result<u128> {
        self.goto(TapState::DrShift)?;
        let mut value: u128 = 0;
        if num_bits > 0 {
            let num_bytes = (num_bits + 7) / 8;
            let cell = std::rc::Rc::new(std::cell::Cell::new(0u128));
            let slot = cell.clone();
            self.programmer.shift(
                sie::SHIFT_TDO,
                num_bits,
                0,
                0,
                true,
                Some(Box::new(move |bytes: Vec<u8>| {
                    let mut v = 0u128;
                    for (i, b) in bytes.iter().enumerate().take(num_bytes) {
                        v |= (*b as u128) << (8 * i);
                    }
                    slot.set(v);
                })),
                None,
            )?;
            value = cell.get();
            self.tracker.set_current(TapState::DrExit1);
        }
        self.goto(TapState::DrPause)?;
        Ok(value)
    }

    /// Shift `expected`/`mask` through the masked-compare SIE slot. The
    /// firmware samples TDO and performs the comparison itself, returning
    /// a single status byte (0 == match). Inside a loop body this becomes
    /// a firmware-evaluated poll: the body accumulates the compare bytes
    /// but no status is read back per iteration, and this call always
    /// succeeds host-side (spec.md §4.5).
    pub fn check_dr(&mut self, num_bits: usize, expected: u128, mask: u128) -> Result<()> {
        self.goto(TapState::DrShift)?;
        if num_bits > 0 {
            if self.programmer.in_loop() {
                self.programmer.shift(sie::SHIFT_TDO_POLL, num_bits, expected, mask, false, None, None)?;
            } else {
                let status = std::rc::Rc::new(std::cell::Cell::new(0u8));
                let slot = status.clone();
                self.programmer.shift(
                    sie::SHIFT_TDO_POLL,
                    num_bits,
                    expected,
                    mask,
                    true,
                    None,
                    Some(Box::new(move |data: Vec<u8>| slot.set(data[0]))),
                )?;
                if status.get() != 0 {
                    self.tracker.set_current(TapState::DrExit1);
                    self.goto(TapState::DrPause)?;
                    return Err(JflashError::DeviceCheckMismatch {
                        expected,
                        mask,
                        status: status.get(),
                    }
                    .into());
                }
            }
            self.tracker.set_current(TapState::DrExit1);
        }
        self.goto(TapState::DrPause)
    }

    /// Drive `clks` TCK pulses with the TAP held at `state` (IDLE unless
    /// otherwise specified), chunked to the firmware's pulse-count limit.
    pub fn runtest(&mut self, clks: u32, state: TapState) -> Result<()> {
        self.goto(state)?;
        let mut remaining = clks;
        while remaining > 0 {
            let chunk = remaining.min(MAX_RUNTEST_CHUNK);
            self.programmer.shift(sie::RUN_TCK, chunk as usize, 0, 0, false, None, None)?;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Force the TAP back to TEST-LOGIC-RESET, releasing the device.
    pub fn tap_reset(&mut self) -> Result<()> {
        self.goto(TapState::Reset)
    }

    pub fn loop_begin(&mut self, iter_count: u16) -> Result<()> {
        self.programmer.loop_begin(iter_count)
    }

    pub fn loop_end(&mut self) -> Result<()> {
        self.programmer.loop_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial_link::test_support::FakePort;

    fn jtag_programmer() -> JtagOps<FakePort> {
        let programmer = Programmer::new_jtag(FakePort::default()).unwrap();
        JtagOps::new(programmer)
    }

    #[test]
    fn write_ir_tracks_irpause() {
        let mut jtag = jtag_programmer();
        jtag.write_ir(8, 0xE0).unwrap();
        assert_eq!(jtag.tap_state(), Some(TapState::IrPause));
    }

    #[test]
    fn write_dr_from_irpause_tracks_drpause() {
        let mut jtag = jtag_programmer();
        jtag.write_ir(8, 0xE0).unwrap();
        jtag.write_dr(32, 0).unwrap();
        assert_eq!(jtag.tap_state(), Some(TapState::DrPause));
    }

    #[test]
    fn read_dr_returns_sampled_bytes() {
        let mut jtag = jtag_programmer();
        jtag.programmer_mut().programmer_link_bytes_for_test(&[0x34, 0x12]);
        let value = jtag.read_dr(16).unwrap();
        assert_eq!(value, 0x1234);
        assert_eq!(jtag.tap_state(), Some(TapState::DrPause));
    }

    #[test]
    fn check_dr_passes_on_zero_status() {
        let mut jtag = jtag_programmer();
        jtag.programmer_mut().programmer_link_bytes_for_test(&[0x00]);
        jtag.check_dr(32, 0x100, 0x2100).unwrap();
        assert_eq!(jtag.tap_state(), Some(TapState::DrPause));
    }

    #[test]
    fn check_dr_reports_mismatch() {
        let mut jtag = jtag_programmer();
        jtag.programmer_mut().programmer_link_bytes_for_test(&[0x01]);
        let err = jtag.check_dr(32, 0x100, 0x2100);
        assert!(err.is_err());
    }

    #[test]
    fn check_dr_inside_loop_never_blocks() {
        let mut jtag = jtag_programmer();
        jtag.goto(TapState::DrShift).unwrap();
        jtag.loop_begin(10_000).unwrap();
        jtag.check_dr(1, 0, 1).unwrap();
        jtag.loop_end().unwrap();
    }

    #[test]
    fn runtest_chunks_large_counts() {
        let mut jtag = jtag_programmer();
        jtag.runtest(2500, TapState::Idle).unwrap();
        assert_eq!(jtag.tap_state(), Some(TapState::Idle));
    }
}
