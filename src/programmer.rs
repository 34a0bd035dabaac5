//! Host-side encoder for the helper board's byte-coded command stream.
//!
//! Reproduces the opcode layout, SIE configuration, and loop-block framing
//! of `TinyFpgaProgrammer`/`JtagTinyFpgaProgrammer` in
//! `original_source/python/tinyfpgaa.py`, generalized from that board's
//! specific pin assignment to the layered API described by the spec.

use std::io::{Read, Write};

use crate::serial_link::{BytesAvailable, ReadCompletion, SerialLink};
use crate::{JflashError, Result};

// --- Control sub-opcodes (top two bits == 00) -----------------------------

const CTRL_CONFIGURE_DIRECTIONS: u8 = 0x00;
const CTRL_SIE_BASE: u8 = 0x08;
const CTRL_LOOP_BEGIN: u8 = 0x10;
const CTRL_LOOP_END: u8 = 0x11;
const CTRL_SHIFT_BASE: u8 = 0x18;
const CTRL_CLEAR_STATUS: u8 = 0x20;
const CTRL_GET_STATUS: u8 = 0x21;

const GROUP_CONTROL: u8 = 0b00;
const GROUP_PIN_UPDATE: u8 = 0b01;
const GROUP_PIN_UPDATE_READBACK: u8 = 0b10;

/// TDO is sampled into bit 2 of the returned pin byte.
const TDO_BIT_MASK: u8 = 0x04;

fn encode_command(group: u8, low6: u8) -> u8 {
    ((group & 0x3) << 6) | (low6 & 0x3f)
}

/// SIE slots pre-programmed for JTAG use (spec.md §4.3).
pub mod sie {
    pub const RUN_TCK: u8 = 0;
    pub const SHIFT_TMS: u8 = 1;
    pub const SHIFT_TDI: u8 = 2;
    pub const SHIFT_TDO: u8 = 3;
    pub const SHIFT_TDO_POLL: u8 = 4;
}

/// Host-remembered shift-site behavior for a configured SIE slot, derived
/// once at configure time per spec.md §4.3.
#[derive(Copy, Clone, Default)]
struct SieSlot {
    gets_input: bool,
    sends_output: bool,
    has_mask: bool,
}

/// Current/pending pin-direction and output-value shadow state
/// (spec.md §3 "Pin shadow state").
#[derive(Default)]
struct PinState {
    directions: u8,
    next_directions: u8,
    output_values: u8,
    pending_pin_reads: usize,
}

struct LoopBody {
    iter_count: u16,
    body: Vec<u8>,
}

/// Host-side encoder for the byte protocol described in spec.md §4.2-§4.5.
///
/// Generic over any `Read + Write + BytesAvailable` transport so tests can
/// drive it against an in-memory fake instead of a real serial port.
pub struct Programmer<T: Read + Write + BytesAvailable> {
    link: SerialLink<T>,
    pins: PinState,
    sie: [SieSlot; 8],
    loop_state: Option<LoopBody>,
}

impl<T: Read + Write + BytesAvailable> Programmer<T> {
    /// Construct a bare programmer with no SIE slots configured.
    pub fn new(port: T) -> Self {
        Programmer {
            link: SerialLink::new(port),
            pins: PinState::default(),
            sie: [SieSlot::default(); 8],
            loop_state: None,
        }
    }

    /// Construct a programmer with the five JTAG SIE slots installed,
    /// mirroring `JtagTinyFpgaProgrammer.__init__`: TMS/TCK/TDI driven as
    /// outputs, TDO as input, and the run_tck/shift_tms/shift_tdi/
    /// shift_tdo/shift_tdo_poll slots configured exactly as in
    /// `original_source/python/tinyfpgaa.py`.
    pub fn new_jtag(port: T) -> Result<Self> {
        let mut prog = Self::new(port);
        // TMS (5), TCK (4), TDI (3) outputs; TDO (2) input.
        prog.configure_pin_directions(0b000111)?;

        prog.configure_sie(sie::RUN_TCK, false, false, false, false, 0, 0x00, 0x10, 0x00, 0x10, 0x00)?;
        prog.configure_sie(sie::SHIFT_TMS, true, false, false, false, 0, 0x00, 0x10, 0x20, 0x30, 0x00)?;
        prog.configure_sie(sie::SHIFT_TDI, true, false, false, false, 0, 0x00, 0x10, 0x08, 0x18, 0x20)?;
        prog.configure_sie(sie::SHIFT_TDO, false, false, true, false, TDO_BIT_MASK, 0x00, 0x10, 0x00, 0x10, 0x20)?;
        prog.configure_sie(sie::SHIFT_TDO_POLL, false, false, true, true, TDO_BIT_MASK, 0x00, 0x10, 0x00, 0x10, 0x20)?;

        prog.link.flush()?;
        Ok(prog)
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        log::trace!("emit: {:02x?}", bytes);
        match &mut self.loop_state {
            Some(body) => {
                body.body.extend_from_slice(bytes);
                Ok(())
            }
            None => self.link.write(bytes),
        }
    }

    /// Configure the direction of all six GPIO pins in one command.
    pub fn configure_pin_directions(&mut self, directions: u8) -> Result<()> {
        self.pins.directions = directions;
        self.pins.next_directions = directions;
        self.emit(&[encode_command(GROUP_CONTROL, CTRL_CONFIGURE_DIRECTIONS), directions])
    }

    /// Drive the six output pins to `values`; if `read_back` is set, the
    /// firmware samples and returns one pin byte (TDO occupies bit 2).
    pub fn drive_and_update(&mut self, values: u8, read_back: bool) -> Result<()> {
        if read_back && self.loop_state.is_some() {
            return Err(JflashError::ProtocolViolation(
                "pin update with read-back is not allowed inside a loop body".into(),
            )
            .into());
        }
        self.pins.output_values = values;
        let group = if read_back { GROUP_PIN_UPDATE_READBACK } else { GROUP_PIN_UPDATE };
        self.emit(&[encode_command(group, values)])?;
        if read_back {
            self.pins.pending_pin_reads += 1;
        }
        Ok(())
    }

    /// Configure one of the 8 firmware bit-banger slots (spec.md §4.3).
    #[allow(clippy::too_many_arguments)]
    pub fn configure_sie(
        &mut self,
        id: u8,
        sends_output: bool,
        input_on_phase0: bool,
        input_on_phase1: bool,
        has_input_mask: bool,
        input_mask: u8,
        do0p0: u8,
        do0p1: u8,
        do1p0: u8,
        do1p1: u8,
        last_phase_overlay: u8,
    ) -> Result<()> {
        if id > 7 {
            return Err(JflashError::ProtocolViolation(format!("SIE id {} out of range", id)).into());
        }
        if self.loop_state.is_some() {
            return Err(JflashError::ProtocolViolation("cannot configure SIE inside a loop body".into()).into());
        }

        self.sie[id as usize] = SieSlot {
            gets_input: (input_on_phase0 || input_on_phase1) && !has_input_mask,
            sends_output: sends_output || has_input_mask,
            has_mask: has_input_mask,
        };

        let mut config_byte = 0u8;
        if sends_output {
            config_byte |= 1;
        }
        if input_on_phase0 {
            config_byte |= 2;
        }
        if input_on_phase1 {
            config_byte |= 4;
        }
        if has_input_mask {
            config_byte |= 8;
        }

        self.emit(&[
            encode_command(GROUP_CONTROL, CTRL_SIE_BASE + id),
            config_byte,
            input_mask,
            do0p0,
            do0p1,
            do1p0,
            do1p1,
            last_phase_overlay,
        ])
    }

    fn shift_header(num_bits: usize) -> (u8, u8) {
        let num_bytes = num_bits / 8;
        let mut last_bits = (num_bits % 8) as u8;
        let mut full_bytes = num_bytes;
        if last_bits == 0 && num_bytes > 0 {
            last_bits = 8;
            full_bytes -= 1;
        }
        (last_bits, full_bytes as u8)
    }

    fn bytes_le(num_bytes: usize, data: u128) -> Vec<u8> {
        (0..num_bytes).map(|i| ((data >> (8 * i)) & 0xff) as u8).collect()
    }

    /// Issue an accelerated shift through SIE slot `id`. `completion`
    /// receives the little-endian sampled TDO bytes if the slot reads
    /// input; `status` receives the firmware's 1-byte masked-compare
    /// result if the slot has a mask. `blocking` selects between the
    /// FIFO-queued `read()` and an immediate `read_blocking()` — both are
    /// valid per spec.md §4.9's design note (a) and (b); callers that need
    /// the result before issuing more commands pass `true`.
    ///
    /// Zero-width shifts are a no-op (spec.md §4.7 edge-case policy).
    pub fn shift(
        &mut self,
        id: u8,
        num_bits: usize,
        data: u128,
        mask: u128,
        blocking: bool,
        completion: Option<ReadCompletion>,
        status: Option<ReadCompletion>,
    ) -> Result<()> {
        if num_bits == 0 {
            if completion.is_some() || status.is_some() {
                return Err(JflashError::ProtocolViolation(
                    "zero-width shift cannot carry a read-back completion".into(),
                )
                .into());
            }
            return Ok(());
        }
        if id > 7 {
            return Err(JflashError::ProtocolViolation(format!("SIE id {} out of range", id)).into());
        }
        let slot = self.sie[id as usize];
        if slot.gets_input && self.loop_state.is_some() {
            return Err(JflashError::ProtocolViolation(
                "a read-expecting shift cannot appear inside a loop body".into(),
            )
            .into());
        }

        let num_bytes = (num_bits + 7) / 8;
        let (last_bits, full_bytes) = Self::shift_header(num_bits);
        let mut cmd = vec![encode_command(GROUP_CONTROL, CTRL_SHIFT_BASE + id), last_bits, full_bytes];

        if slot.has_mask {
            let data_bytes = Self::bytes_le(num_bytes, data);
            let mask_bytes = Self::bytes_le(num_bytes, mask);
            for i in 0..num_bytes {
                cmd.push(data_bytes[i]);
                cmd.push(mask_bytes[i]);
            }
        } else if slot.sends_output {
            cmd.extend(Self::bytes_le(num_bytes, data));
        }

        self.emit(&cmd)?;

        if self.loop_state.is_some() {
            return Ok(());
        }

        if slot.gets_input {
            let cb = completion.unwrap_or_else(|| Box::new(|_| {}));
            if blocking {
                self.link.read_blocking(num_bytes, cb)?;
            } else {
                self.link.flush()?;
                self.link.read(num_bytes, cb);
            }
        } else if slot.has_mask {
            if let Some(cb) = status {
                if blocking {
                    self.link.read_blocking(1, cb)?;
                } else {
                    self.link.flush()?;
                    self.link.read(1, cb);
                }
            }
        }

        Ok(())
    }

    /// Like `shift`, but for payloads wider than 128 bits. Output-only:
    /// no read-back or masked-compare support. The boundary-scan
    /// register write in the device sequencer's programming sequence is
    /// this protocol's only user of a payload this wide.
    pub fn shift_wide(&mut self, id: u8, num_bits: usize, data: &[u8]) -> Result<()> {
        if num_bits == 0 {
            return Ok(());
        }
        if id > 7 {
            return Err(JflashError::ProtocolViolation(format!("SIE id {} out of range", id)).into());
        }
        let slot = self.sie[id as usize];
        if slot.gets_input || slot.has_mask {
            return Err(JflashError::ProtocolViolation(
                "shift_wide only supports output-only SIE slots".into(),
            )
            .into());
        }

        let num_bytes = (num_bits + 7) / 8;
        let (last_bits, full_bytes) = Self::shift_header(num_bits);
        let mut cmd = vec![encode_command(GROUP_CONTROL, CTRL_SHIFT_BASE + id), last_bits, full_bytes];
        if slot.sends_output {
            cmd.extend(data.iter().take(num_bytes).copied());
        }
        self.emit(&cmd)
    }

    /// Begin a loop body: subsequent emitted bytes are buffered host-side
    /// instead of transmitted. Loops do not nest.
    pub fn loop_begin(&mut self, iter_count: u16) -> Result<()> {
        if self.loop_state.is_some() {
            return Err(JflashError::ProtocolViolation("loops do not nest".into()).into());
        }
        log::debug!("loop_begin: {} iterations", iter_count);
        self.loop_state = Some(LoopBody { iter_count, body: Vec::new() });
        Ok(())
    }

    /// Flush any queued writes, then emit the full loop encoding
    /// `[0x10, cnt_lo, cnt_hi, ...body, 0x11]` in one shot so it fits a
    /// single transmit flush (the firmware has no second loop buffer).
    pub fn loop_end(&mut self) -> Result<()> {
        let body = self
            .loop_state
            .take()
            .ok_or_else(|| JflashError::ProtocolViolation("end_loop without a matching loop".into()))?;

        log::debug!("loop_end: {} body bytes, {} iterations", body.body.len(), body.iter_count);
        self.link.flush()?;

        let mut encoded = Vec::with_capacity(4 + body.body.len());
        encoded.push(encode_command(GROUP_CONTROL, CTRL_LOOP_BEGIN));
        encoded.push((body.iter_count & 0xff) as u8);
        encoded.push((body.iter_count >> 8) as u8);
        encoded.extend(body.body);
        encoded.push(encode_command(GROUP_CONTROL, CTRL_LOOP_END));

        self.link.write(&encoded)
    }

    pub fn in_loop(&self) -> bool {
        self.loop_state.is_some()
    }

    pub fn clear_status(&mut self) -> Result<()> {
        self.emit(&[encode_command(GROUP_CONTROL, CTRL_CLEAR_STATUS)])
    }

    /// Issue a synchronous `get_status` so the serial pipeline has bounded
    /// outstanding work at progress checkpoints (spec.md §4.8).
    pub fn get_status(&mut self) -> Result<u8> {
        self.emit(&[encode_command(GROUP_CONTROL, CTRL_GET_STATUS)])?;
        let result = std::rc::Rc::new(std::cell::Cell::new(0u8));
        let slot = result.clone();
        self.link.read_blocking(1, Box::new(move |data| slot.set(data[0])))?;
        Ok(result.get())
    }

    /// Drain any stale bytes sitting on the link before a programming run
    /// begins (spec.md §4.8 phase 1).
    pub fn drain_stale(&mut self) -> Result<usize> {
        let mut drained = 0;
        loop {
            let available = self.link.task()?;
            if available == 0 {
                break;
            }
            drained += 1;
            if drained > 1000 {
                break;
            }
        }
        Ok(drained)
    }

    pub fn task(&mut self) -> Result<usize> {
        self.link.task()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.link.flush()
    }
}

impl<T: Read + Write + BytesAvailable> Drop for Programmer<T> {
    /// Park all six GPIO pins as inputs (high-Z) before the link goes
    /// away, mirroring the teacher's `Drop for Programmer` (`high_z_mode`
    /// + `led_off`) generalized to this board's pin set, which has no LED
    /// control of its own.
    fn drop(&mut self) {
        self.configure_pin_directions(0).ok();
        self.link.flush().ok();
    }
}

impl Programmer<Box<dyn serialport::SerialPort>> {
    /// Find the helper board by VID:PID (`1209:2101`) and open it at
    /// 12,000,000 baud / 8N1, per spec.md §6.
    pub fn find() -> Result<Self> {
        let ports = serialport::available_ports().map_err(|e| {
            JflashError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        for info in ports {
            if let serialport::SerialPortType::UsbPort(usb) = &info.port_type {
                if usb.vid == crate::ID_VENDOR && usb.pid == crate::ID_PRODUCT {
                    return Self::open(&info.port_name);
                }
            }
        }
        Err(JflashError::NoDeviceFound.into())
    }

    /// Open a specific named serial port, bypassing VID:PID discovery
    /// (the CLI's `--port` override).
    pub fn open(name: &str) -> Result<Self> {
        let port = serialport::new(name, 12_000_000)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(std::time::Duration::from_secs(10))
            .open()
            .map_err(|_| JflashError::DeviceNotFound)?;
        Self::new_jtag(port)
    }
}

impl Programmer<crate::serial_link::test_support::FakePort> {
    /// Queue bytes for the next read(s) to observe, standing in for the
    /// firmware's replies. Used by this crate's own tests and by
    /// downstream integration tests alike.
    pub fn programmer_link_bytes_for_test(&mut self, bytes: &[u8]) {
        self.link.port.to_read.extend(bytes.iter().copied());
    }

    /// Bytes the link has written so far, for asserting on the emitted
    /// byte protocol from outside this module.
    pub fn programmer_link_written_for_test(&self) -> &[u8] {
        &self.link.port.written
    }
}
