//! Byte-protocol properties of `Programmer`, driven against the crate's
//! in-memory fake serial port instead of real hardware.

use jflash::test_support::FakePort;
use jflash::Programmer;

fn programmer() -> Programmer<FakePort> {
    Programmer::new_jtag(FakePort::default()).unwrap()
}

#[test]
fn new_jtag_configures_pin_directions_before_any_sie_slot() {
    let mut p = programmer();
    p.flush().unwrap();
    // First emitted command is the pin-direction configure (sub-opcode 0x00).
    assert_eq!(p.programmer_link_written_for_test()[0], 0x00);
}

#[test]
fn loop_end_without_loop_begin_is_rejected() {
    let mut p = programmer();
    assert!(p.loop_end().is_err());
}

#[test]
fn loops_do_not_nest() {
    let mut p = programmer();
    p.loop_begin(1).unwrap();
    assert!(p.loop_begin(1).is_err());
}

#[test]
fn loop_body_is_buffered_until_loop_end() {
    let mut p = programmer();
    p.flush().unwrap();
    let before = p.programmer_link_written_for_test().len();
    p.loop_begin(10).unwrap();
    p.shift(jflash::sie::RUN_TCK, 8, 0, 0, false, None, None).unwrap();
    assert_eq!(p.programmer_link_written_for_test().len(), before, "loop body must not be transmitted yet");
    p.loop_end().unwrap();
    p.flush().unwrap();
    assert!(p.programmer_link_written_for_test().len() > before);
}

#[test]
fn read_expecting_shift_is_rejected_inside_a_loop_body() {
    let mut p = programmer();
    p.loop_begin(10).unwrap();
    let err = p.shift(jflash::sie::SHIFT_TDO, 8, 0, 0, false, None, None);
    assert!(err.is_err());
}

#[test]
fn masked_compare_shift_is_allowed_inside_a_loop_body() {
    let mut p = programmer();
    p.loop_begin(10_000).unwrap();
    assert!(p.shift(jflash::sie::SHIFT_TDO_POLL, 8, 0, 0xff, false, None, None).is_ok());
    p.loop_end().unwrap();
}

#[test]
fn blocking_shift_returns_the_queued_reply() {
    let mut p = programmer();
    p.programmer_link_bytes_for_test(&[0x34, 0x12]);
    let result = std::rc::Rc::new(std::cell::Cell::new(0u16));
    let slot = result.clone();
    p.shift(
        jflash::sie::SHIFT_TDO,
        16,
        0,
        0,
        true,
        Some(Box::new(move |bytes| slot.set(u16::from_le_bytes([bytes[0], bytes[1]])))),
        None,
    )
    .unwrap();
    assert_eq!(result.get(), 0x1234);
}

#[test]
fn get_status_returns_the_queued_byte() {
    let mut p = programmer();
    p.programmer_link_bytes_for_test(&[0x07]);
    assert_eq!(p.get_status().unwrap(), 0x07);
}

#[test]
fn zero_width_shift_with_a_completion_is_rejected() {
    let mut p = programmer();
    let err = p.shift(jflash::sie::SHIFT_TDO, 0, 0, 0, true, Some(Box::new(|_| {})), None);
    assert!(err.is_err());
}
