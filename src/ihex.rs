//! Intel-HEX record codec.
//!
//! Line-level parsing and serialization of the textual record format, with
//! structural and checksum validation. Carries no knowledge of the BSL
//! protocol; the application layer moves parsed records in and out of a
//! [`crate::memory::MemoryMap`].

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;

const DATA_RECORD_TYPE: u8 = 0x00;
const EOF_RECORD_TYPE: u8 = 0x01;
const EXTENDED_SEGMENT_ADDRESS_TYPE: u8 = 0x02;
const START_SEGMENT_ADDRESS_TYPE: u8 = 0x03;
const EXTENDED_LINEAR_ADDRESS_TYPE: u8 = 0x04;
const START_LINEAR_ADDRESS_TYPE: u8 = 0x05;

/// Longest legal line: start code, the three fixed fields, 255 data bytes
/// and the checksum byte.
const MAX_LINE_LENGTH: usize = 1 + 2 + 4 + 2 + 255 * 2 + 2;

#[derive(Debug, Error)]
pub enum IhexError {
    #[error("failed to access hex file: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: record does not start with ':'")]
    MissingStartCode { line: usize },

    #[error("line {line}: line too long")]
    LineTooLong { line: usize },

    #[error("line {line}: cannot parse record fields")]
    BadFields { line: usize },

    #[error("line {line}: record shorter than its declared length")]
    Truncated { line: usize },

    #[error("line {line}: checksum mismatch")]
    Checksum { line: usize },

    #[error("line {line}: unknown record type 0x{record_type:02x}")]
    UnknownRecordType { line: usize, record_type: u8 },

    #[error("no end-of-file record present")]
    MissingEof,
}

/// Record kinds, the end-of-file marker excluded.
///
/// The EOF record terminates a document but is never materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Data,
    ExtendedSegmentAddress,
    StartSegmentAddress,
    ExtendedLinearAddress,
    StartLinearAddress,
}

impl RecordKind {
    fn from_type(record_type: u8) -> Option<RecordKind> {
        match record_type {
            DATA_RECORD_TYPE => Some(RecordKind::Data),
            EXTENDED_SEGMENT_ADDRESS_TYPE => Some(RecordKind::ExtendedSegmentAddress),
            START_SEGMENT_ADDRESS_TYPE => Some(RecordKind::StartSegmentAddress),
            EXTENDED_LINEAR_ADDRESS_TYPE => Some(RecordKind::ExtendedLinearAddress),
            START_LINEAR_ADDRESS_TYPE => Some(RecordKind::StartLinearAddress),
            _ => None,
        }
    }

    fn type_code(self) -> u8 {
        match self {
            RecordKind::Data => DATA_RECORD_TYPE,
            RecordKind::ExtendedSegmentAddress => EXTENDED_SEGMENT_ADDRESS_TYPE,
            RecordKind::StartSegmentAddress => START_SEGMENT_ADDRESS_TYPE,
            RecordKind::ExtendedLinearAddress => EXTENDED_LINEAR_ADDRESS_TYPE,
            RecordKind::StartLinearAddress => START_LINEAR_ADDRESS_TYPE,
        }
    }
}

/// One line of a hex document.
///
/// For the address-extension kinds `data` holds the two byte value to be
/// interpreted, not memory content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub load_offset: u16,
    pub kind: RecordKind,
    pub data: Vec<u8>,
}

/// Parse a complete hex document.
///
/// Two passes: the first validates every line (structure, fields, checksum,
/// record type) up to the required end-of-file record, the second
/// materializes the records. Lines after the EOF record are ignored.
pub fn parse(text: &str) -> Result<Vec<Record>, IhexError> {
    let count = check_document(text)?;

    let mut records = Vec::with_capacity(count);
    for (index, line) in text.lines().take(count).enumerate() {
        records.push(parse_record(line.trim_end(), index + 1)?);
    }

    Ok(records)
}

/// Read and parse a hex file.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<Record>, IhexError> {
    let text = fs::read_to_string(path)?;
    parse(&text)
}

/// Serialize records, terminated by the end-of-file marker line.
pub fn write<W: Write>(records: &[Record], writer: &mut W) -> io::Result<()> {
    for record in records {
        let record_type = record.kind.type_code();

        write!(
            writer,
            ":{:02x}{:04x}{:02x}",
            record.data.len() as u8,
            record.load_offset,
            record_type
        )?;

        let mut sum = (record.data.len() as u8)
            .wrapping_add((record.load_offset >> 8) as u8)
            .wrapping_add(record.load_offset as u8)
            .wrapping_add(record_type);

        for byte in &record.data {
            write!(writer, "{:02x}", byte)?;
            sum = sum.wrapping_add(*byte);
        }

        writeln!(writer, "{:02x}", sum.wrapping_neg())?;
    }

    writer.write_all(b":00000001FF\n")
}

/// Serialize records to a file.
pub fn write_file<P: AsRef<Path>>(records: &[Record], path: P) -> Result<(), IhexError> {
    let mut file = fs::File::create(path)?;
    write(records, &mut file)?;
    Ok(())
}

/// Absolute `(address, data)` view of the data records.
///
/// Maintains a running 32-bit base: extended-segment-address records replace
/// its low 16 bits, extended-linear-address records its high 16. Start
/// address records carry no memory content and are skipped.
pub fn resolve_addresses(records: &[Record]) -> Vec<(u32, &[u8])> {
    let mut base: u32 = 0;
    let mut resolved = Vec::new();

    for record in records {
        match record.kind {
            RecordKind::Data => {
                resolved.push((base + u32::from(record.load_offset), record.data.as_slice()))
            }
            RecordKind::ExtendedSegmentAddress => {
                if let [high, low] = record.data[..] {
                    base = (base & !0xFFFF) + (u32::from(high) << 8 | u32::from(low));
                }
            }
            RecordKind::ExtendedLinearAddress => {
                if let [high, low] = record.data[..] {
                    base = (base & 0xFFFF) + ((u32::from(high) << 8 | u32::from(low)) << 16);
                }
            }
            RecordKind::StartSegmentAddress | RecordKind::StartLinearAddress => (),
        }
    }

    resolved
}

/// First pass: validate every line up to the EOF record and count the
/// records to materialize.
fn check_document(text: &str) -> Result<usize, IhexError> {
    let mut count = 0;

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim_end();
        let number = index + 1;

        if line.len() > MAX_LINE_LENGTH {
            return Err(IhexError::LineTooLong { line: number });
        }
        if !line.starts_with(':') {
            return Err(IhexError::MissingStartCode { line: number });
        }

        let (length, _, record_type) = parse_fields(line, number)?;
        verify_checksum(line, length, number)?;

        match record_type {
            EOF_RECORD_TYPE => return Ok(count),
            t if RecordKind::from_type(t).is_some() => count += 1,
            t => {
                return Err(IhexError::UnknownRecordType {
                    line: number,
                    record_type: t,
                })
            }
        }
    }

    Err(IhexError::MissingEof)
}

fn parse_record(line: &str, number: usize) -> Result<Record, IhexError> {
    let (length, load_offset, record_type) = parse_fields(line, number)?;

    let kind = RecordKind::from_type(record_type).ok_or(IhexError::UnknownRecordType {
        line: number,
        record_type,
    })?;

    let mut data = Vec::with_capacity(usize::from(length));
    for i in 0..usize::from(length) {
        data.push(hex_byte(line, 9 + 2 * i, number)?);
    }

    Ok(Record {
        load_offset,
        kind,
        data,
    })
}

fn parse_fields(line: &str, number: usize) -> Result<(u8, u16, u8), IhexError> {
    let length = hex_byte(line, 1, number)?;

    let digits = line.get(3..7).ok_or(IhexError::Truncated { line: number })?;
    let load_offset =
        u16::from_str_radix(digits, 16).map_err(|_| IhexError::BadFields { line: number })?;

    let record_type = hex_byte(line, 7, number)?;

    Ok((length, load_offset, record_type))
}

/// Sum of every decoded byte on the line, checksum included, must be zero.
fn verify_checksum(line: &str, length: u8, number: usize) -> Result<(), IhexError> {
    let mut sum = 0u8;

    for i in 0..5 + usize::from(length) {
        sum = sum.wrapping_add(hex_byte(line, 1 + 2 * i, number)?);
    }

    if sum != 0 {
        return Err(IhexError::Checksum { line: number });
    }

    Ok(())
}

fn hex_byte(line: &str, at: usize, number: usize) -> Result<u8, IhexError> {
    let digits = line
        .get(at..at + 2)
        .ok_or(IhexError::Truncated { line: number })?;
    u8::from_str_radix(digits, 16).map_err(|_| IhexError::BadFields { line: number })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_data_record() {
        let records = parse(":10010000214601360121470136007EFE09D2190140\n:00000001FF\n").unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Data);
        assert_eq!(records[0].load_offset, 0x0100);
        assert_eq!(records[0].data.len(), 0x10);
        assert_eq!(&records[0].data[..4], &[0x21, 0x46, 0x01, 0x36]);
    }

    #[test]
    fn serializes_with_terminator() {
        let records = vec![Record {
            load_offset: 0x0100,
            kind: RecordKind::Data,
            data: vec![0x21, 0x46],
        }];

        let mut out = Vec::new();
        write(&records, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            ":02010000214696\n:00000001FF\n"
        );
    }

    #[test]
    fn roundtrips_mixed_records() {
        let records = vec![
            Record {
                load_offset: 0,
                kind: RecordKind::ExtendedLinearAddress,
                data: vec![0x00, 0x01],
            },
            Record {
                load_offset: 0x8000,
                kind: RecordKind::Data,
                data: (0u8..32).collect(),
            },
            Record {
                load_offset: 0x8020,
                kind: RecordKind::Data,
                data: vec![0xFF, 0x00, 0xAA, 0x55],
            },
            Record {
                load_offset: 0,
                kind: RecordKind::StartLinearAddress,
                data: vec![0x00, 0x01, 0x80, 0x00],
            },
        ];

        let mut out = Vec::new();
        write(&records, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(parse(&text).unwrap(), records);
    }

    #[test]
    fn resolves_extended_linear_addresses() {
        let records = parse(":020000040010EA\n:02000400BEEF4D\n:00000001FF\n").unwrap();

        let resolved = resolve_addresses(&records);
        assert_eq!(resolved, vec![(0x0010_0004, &[0xBE, 0xEF][..])]);
    }

    #[test]
    fn resolves_extended_segment_addresses() {
        let records = vec![
            Record {
                load_offset: 0,
                kind: RecordKind::ExtendedSegmentAddress,
                data: vec![0x12, 0x00],
            },
            Record {
                load_offset: 0x0010,
                kind: RecordKind::Data,
                data: vec![0x01],
            },
        ];

        // The segment value replaces the low 16 bits of the base.
        assert_eq!(resolve_addresses(&records), vec![(0x1210, &[0x01][..])]);
    }

    #[test]
    fn checksum_error_reports_the_line() {
        let result = parse(":020000040010EA\n:02000400BEEF4E\n:00000001FF\n");
        assert!(matches!(result, Err(IhexError::Checksum { line: 2 })));
    }

    #[test]
    fn missing_eof_is_rejected() {
        let result = parse(":020000040010EA\n");
        assert!(matches!(result, Err(IhexError::MissingEof)));
    }

    #[test]
    fn missing_start_code_is_rejected() {
        let result = parse("020000040010EA\n:00000001FF\n");
        assert!(matches!(result, Err(IhexError::MissingStartCode { line: 1 })));
    }

    #[test]
    fn unknown_record_type_is_rejected() {
        let result = parse(":00000006FA\n:00000001FF\n");
        assert!(matches!(
            result,
            Err(IhexError::UnknownRecordType {
                line: 1,
                record_type: 0x06
            })
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let result = parse(":0A000000BEEF\n:00000001FF\n");
        assert!(matches!(result, Err(IhexError::Truncated { line: 1 })));
    }

    #[test]
    fn content_after_the_eof_record_is_ignored() {
        let records = parse(":02000400BEEF4D\n:00000001FF\nnot a record\n").unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn carriage_returns_are_tolerated() {
        let records = parse(":02000400BEEF4D\r\n:00000001FF\r\n").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, vec![0xBE, 0xEF]);
    }
}
