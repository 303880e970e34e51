//! BSL wire format: framing, checksum and command opcodes.
//!
//! Every request is `0x80, opcode, len, len, sub-header[4], data..` followed
//! by a two byte checksum trailer, low byte first. The duplicated length
//! field counts the four sub-header bytes plus the data, not the checksum.

use thiserror::Error;

/// Synchronization character, also the header byte of every frame.
pub const SYNC: u8 = 0x80;

/// Single byte acknowledge from the device.
pub const ACK: u8 = 0x90;
/// Single byte negative acknowledge from the device.
pub const NACK: u8 = 0xA0;

/// Largest data block a single read or write command can carry.
pub const MAX_BLOCK_SIZE: usize = 250;

/// BSL passwords are the 32 bytes of the interrupt vector table.
pub const PASSWORD_SIZE: usize = 32;

/// Flash controller key, required in the erase commands.
pub const ERASE_KEY: u8 = 0xA5;

/// Erase mode selecting a single segment.
pub const MODE_SEGMENT_ERASE: u8 = 0x02;
/// Erase mode selecting the main or information memory area.
pub const MODE_MAIN_ERASE: u8 = 0x04;

/// Bytes of a data response that are not payload: header, command echo,
/// the duplicated length field and the checksum trailer.
pub const DATA_RESPONSE_OVERHEAD: usize = 6;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Receive the protection password ("RX password")
    RxPassword = 0x10,

    /// Receive a block of data to be written to memory ("RX data block")
    RxDataBlock = 0x12,

    /// Transmit a block of data read from memory ("TX data block")
    TxDataBlock = 0x14,

    /// Erase one segment, or the main/information area, depending on the mode byte.
    Erase = 0x16,

    /// Erase the entire flash, main and information memory both.
    MassErase = 0x18,

    /// Load the program counter and start execution at an address.
    LoadPc = 0x1A,

    /// Switch the device UART to another baud rate.
    ChangeBaudrate = 0x20,

    /// Set the memory offset for devices with more than 64k of address space.
    SetMemOffset = 0x21,
}

/// Ways an incoming frame can fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ResponseError {
    #[error("device reported NACK")]
    Nack,

    #[error("unexpected response header 0x{0:02x}")]
    Header(u8),

    #[error("duplicated length fields disagree")]
    LengthFields,

    #[error("length field does not match the received size")]
    Length,

    #[error("response checksum mismatch")]
    Checksum,
}

/// Computes the frame checksum over a buffer of even length.
///
/// The first little-endian 16-bit pair seeds the value, every following pair
/// is XORed in, and the result is complemented.
pub fn checksum(data: &[u8]) -> u16 {
    debug_assert!(data.len() >= 2 && data.len() % 2 == 0);

    let mut checksum = u16::from(data[0]) | u16::from(data[1]) << 8;

    for pair in data[2..].chunks(2) {
        checksum ^= u16::from(pair[0]) | u16::from(pair[1]) << 8;
    }

    !checksum
}

/// Assembles a complete request frame, checksum trailer included.
///
/// `length` is the value of the duplicated length field, which per-command
/// may differ from `4 + data.len()` (the password command declares 24).
pub fn build_request(command: Command, length: u8, sub_header: [u8; 4], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + data.len() + 2);

    frame.push(SYNC);
    frame.push(command as u8);
    frame.push(length);
    frame.push(length);
    frame.extend_from_slice(&sub_header);
    frame.extend_from_slice(data);

    let checksum = checksum(&frame);
    frame.push(checksum as u8);
    frame.push((checksum >> 8) as u8);

    frame
}

/// Classifies a single byte ACK-style response.
pub fn parse_ack(byte: u8) -> Result<(), ResponseError> {
    match byte {
        ACK => Ok(()),
        NACK => Err(ResponseError::Nack),
        other => Err(ResponseError::Header(other)),
    }
}

/// Validates a complete data response and returns its payload.
///
/// Expects header, length fields and trailer to be present; the caller reads
/// exactly `DATA_RESPONSE_OVERHEAD + payload` bytes off the wire first.
pub fn validate_data_response(frame: &[u8]) -> Result<&[u8], ResponseError> {
    if frame.len() < DATA_RESPONSE_OVERHEAD {
        return Err(ResponseError::Length);
    }

    match frame[0] {
        SYNC => (),
        NACK => return Err(ResponseError::Nack),
        other => return Err(ResponseError::Header(other)),
    }

    if frame[2] != frame[3] {
        return Err(ResponseError::LengthFields);
    }

    if usize::from(frame[2]) != frame.len() - DATA_RESPONSE_OVERHEAD {
        return Err(ResponseError::Length);
    }

    let checksum = checksum(&frame[..frame.len() - 2]);
    if frame[frame.len() - 2] != checksum as u8 || frame[frame.len() - 1] != (checksum >> 8) as u8 {
        return Err(ResponseError::Checksum);
    }

    Ok(&frame[4..frame.len() - 2])
}
