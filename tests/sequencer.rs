//! End-to-end ECP5 programming sequence, driven against the in-memory
//! fake serial port the same way the crate's own unit tests do.

use jflash::test_support::FakePort;
use jflash::{DeviceSequencer, JedecFile, JtagOps, Programmer, ProgressEvent};

const JED_TEXT: &str = "\
NOTE CONFIG DATA*
L00000
11
00*
E00
0000*
";

fn happy_sequencer() -> DeviceSequencer<FakePort> {
    let programmer = Programmer::new_jtag(FakePort::default()).unwrap();
    DeviceSequencer::new(JtagOps::new(programmer))
}

fn feed(seq: &mut DeviceSequencer<FakePort>, byte: u8, times: usize) {
    for _ in 0..times {
        seq.jtag_mut().programmer_mut().programmer_link_bytes_for_test(&[byte]);
    }
}

#[test]
fn program_runs_end_to_end_against_a_matching_mock_device() {
    let fuses = JedecFile::parse(JED_TEXT).unwrap();
    let mut seq = happy_sequencer();
    feed(&mut seq, 0x00, 64);

    let mut events = Vec::new();
    seq.program(&fuses, |e| events.push(e)).unwrap();

    assert!(events.contains(&ProgressEvent::Phase("Erasing configuration flash".into())));
    assert!(events.contains(&ProgressEvent::Phase("Done".into())));
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Failed(_))));
}

#[test]
fn program_reports_failure_on_mismatched_status() {
    let fuses = JedecFile::parse(JED_TEXT).unwrap();
    let mut seq = happy_sequencer();
    // The first masked check_dr (key-protection fuses) sees a failing byte.
    feed(&mut seq, 0x01, 1);
    feed(&mut seq, 0x00, 64);

    let mut events = Vec::new();
    let result = seq.program(&fuses, |e| events.push(e));
    assert!(result.is_err());
}

#[test]
fn program_reports_failure_on_a_bad_status_checkpoint() {
    let fuses = JedecFile::parse(JED_TEXT).unwrap();
    let mut seq = happy_sequencer();
    // Both masked check_dr calls before the first checkpoint pass; the
    // checkpoint's own get_status then reports a device-side failure.
    feed(&mut seq, 0x00, 2);
    feed(&mut seq, 0x01, 1);
    feed(&mut seq, 0x00, 64);

    let mut events = Vec::new();
    let result = seq.program(&fuses, |e| events.push(e));
    assert!(result.is_err());
    assert!(events.iter().any(|e| matches!(e, ProgressEvent::Failed(_))));
}

#[test]
fn program_reports_progress_every_twenty_rows() {
    // A single config field with 25 data lines exercises the
    // Rows(PROGRESS_UPDATE_FREQ) checkpoint path (one row per line).
    let mut jed_text = String::from("NOTE CONFIG DATA*\nL00000\n");
    for i in 0..25 {
        let row = if i % 2 == 0 { "11" } else { "00" };
        jed_text.push_str(row);
        jed_text.push('\n');
    }
    jed_text.push_str("*\nE00\n0000*\n");

    let fuses = JedecFile::parse(&jed_text).unwrap();
    let mut seq = happy_sequencer();
    feed(&mut seq, 0x00, 512);

    let mut events = Vec::new();
    seq.program(&fuses, |e| events.push(e)).unwrap();

    assert!(events.iter().any(|e| matches!(e, ProgressEvent::Rows(20))));
}
