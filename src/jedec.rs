//! Fuse-map consumer contract (`FuseMap`) plus a parser for the JEDEC
//! (`.jed`) text format, ported from `JedecFile` in
//! `original_source/python/tinyfpgaa.py`.
//!
//! `sequencer::program` only needs row/feature data through the `FuseMap`
//! trait; `JedecFile` is one implementor, `BitstreamFile` (a raw,
//! row-chunked stand-in for a `.bit` file) is another.

use crate::{JflashError, Result};

/// Row/feature access a device sequencer needs to program an ECP5,
/// independent of the source file format.
pub trait FuseMap {
    fn row_count(&self) -> usize {
        self.config_rows().len() + self.ebr_rows().len() + self.ufm_rows().map_or(0, <[u128]>::len)
    }
    fn config_rows(&self) -> &[u128];
    fn ebr_rows(&self) -> &[u128];
    fn ufm_rows(&self) -> Option<&[u128]>;
    fn feature_row(&self) -> u64;
    fn feature_bits(&self) -> u16;
}

/// A parsed JEDEC fuse map: config data, optional EBR-init and UFM
/// ("TAG DATA") rows, and the feature row/feature-bits pair.
#[derive(Debug, Default, Clone)]
pub struct JedecFile {
    config_rows: Vec<u128>,
    ebr_rows: Vec<u128>,
    ufm_rows: Option<Vec<u128>>,
    feature_row: u64,
    feature_bits: u16,
}

/// A fuse row is stored reversed-then-parsed as binary, following
/// `line_to_int` in the original parser. Rows wider than 128 bits are
/// truncated to their low 128 bits (see DESIGN.md).
fn line_to_int(line: &str) -> Option<u128> {
    let reversed: String = line.chars().rev().collect();
    u128::from_str_radix(&reversed, 2).ok()
}

impl JedecFile {
    /// Parse a `.jed` file's text. A field is a run of lines ending with
    /// the first one that contains `*`; a field's first line tags its
    /// kind (`NOTE ...`, `L<addr>` fuse data, or `E<row>`/feature-bits
    /// record), exactly as `JedecFile._parse` does.
    pub fn parse(text: &str) -> Result<Self> {
        let mut file = JedecFile::default();
        let mut last_note = String::new();

        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty() && *l != "\\x03");

        let mut current = match lines.next() {
            Some(l) => l,
            None => return Err(JflashError::ProtocolViolation("empty JEDEC file".into()).into()),
        };

        loop {
            let mut field: Vec<String> = Vec::new();
            let mut line = current;
            loop {
                let ends_field = line.contains('*');
                field.push(line.strip_suffix('*').unwrap_or(line).to_string());
                if ends_field {
                    break;
                }
                match lines.next() {
                    Some(l) => line = l,
                    None => break,
                }
            }
            let refs: Vec<&str> = field.iter().map(String::as_str).collect();
            Self::process_field(&refs, &mut file, &mut last_note);

            current = match lines.next() {
                Some(l) => l,
                None => break,
            };
        }

        Ok(file)
    }

    fn process_field(field: &[&str], file: &mut JedecFile, last_note: &mut String) {
        let head = field[0];
        if let Some(note) = head.strip_prefix("NOTE ") {
            *last_note = note.to_string();
        } else if head.starts_with('L') {
            let data: Vec<u128> = field[1..].iter().filter_map(|l| line_to_int(l)).collect();

            if last_note.contains("EBR_INIT DATA") {
                file.ebr_rows = data;
            } else if last_note.contains("END CONFIG DATA") {
                // Trailing padding rows; not part of the programmable map.
            } else if last_note.contains("TAG DATA") {
                file.ufm_rows = Some(data);
            } else {
                file.config_rows = data;
            }
        } else if head.starts_with('E') && field.len() > 1 {
            file.feature_row = line_to_int(&head[1..]).unwrap_or(0) as u64;
            file.feature_bits = line_to_int(field[1]).unwrap_or(0) as u16;
        }
    }
}

impl FuseMap for JedecFile {
    fn config_rows(&self) -> &[u128] {
        &self.config_rows
    }

    fn ebr_rows(&self) -> &[u128] {
        &self.ebr_rows
    }

    fn ufm_rows(&self) -> Option<&[u128]> {
        self.ufm_rows.as_deref()
    }

    fn feature_row(&self) -> u64 {
        self.feature_row
    }

    fn feature_bits(&self) -> u16 {
        self.feature_bits
    }
}

/// A raw `.bit`-style bitstream, chunked into row-sized (16-byte) words
/// with no further decoding — spec.md's Non-goals exclude bitstream
/// decoding beyond row-sized chunks, and this type exists only so
/// `--bitstream` has a second `FuseMap` implementor to select, per
/// spec.md §9's Open Question on treating it as the same row/feature
/// contract as the JEDEC consumer.
#[derive(Debug, Default, Clone)]
pub struct BitstreamFile {
    config_rows: Vec<u128>,
}

impl BitstreamFile {
    const ROW_BYTES: usize = 16;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let config_rows = bytes
            .chunks(Self::ROW_BYTES)
            .map(|chunk| {
                let mut row = 0u128;
                for (i, b) in chunk.iter().enumerate() {
                    row |= (*b as u128) << (8 * i);
                }
                row
            })
            .collect();
        BitstreamFile { config_rows }
    }
}

impl FuseMap for BitstreamFile {
    fn config_rows(&self) -> &[u128] {
        &self.config_rows
    }

    fn ebr_rows(&self) -> &[u128] {
        &[]
    }

    fn ufm_rows(&self) -> Option<&[u128]> {
        None
    }

    fn feature_row(&self) -> u64 {
        0
    }

    fn feature_bits(&self) -> u16 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
\\x02QF32768*
NOTE CONFIG DATA*
L00000
11
00*
NOTE EBR_INIT DATA*
L04096
01*
NOTE TAG DATA*
L08192
10*
NOTE DEVICE NAME:LFE5U-25*
E00
0001*
";

    #[test]
    fn parses_config_ebr_and_ufm_rows() {
        let jed = JedecFile::parse(SAMPLE).unwrap();
        // "11" reversed is "11" -> 0b11 = 3; "00" -> 0.
        assert_eq!(jed.config_rows(), &[3, 0]);
        assert_eq!(jed.ebr_rows(), &[0b10]);
        assert_eq!(jed.ufm_rows(), Some(&[0b01][..]));
    }

    #[test]
    fn parses_feature_row_and_bits() {
        let jed = JedecFile::parse(SAMPLE).unwrap();
        assert_eq!(jed.feature_row(), 0);
        assert_eq!(jed.feature_bits(), 0b1000);
    }

    #[test]
    fn row_count_sums_all_three_fields() {
        let jed = JedecFile::parse(SAMPLE).unwrap();
        assert_eq!(jed.row_count(), 2 + 1 + 1);
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(JedecFile::parse("").is_err());
    }

    #[test]
    fn bitstream_file_chunks_into_16_byte_rows() {
        let bytes: Vec<u8> = (0..32u8).collect();
        let bits = BitstreamFile::from_bytes(&bytes);
        assert_eq!(bits.config_rows().len(), 2);
        assert_eq!(bits.ebr_rows().len(), 0);
        assert!(bits.ufm_rows().is_none());
    }
}
