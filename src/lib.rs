//! MSP430 Serial Bootstrap Loader.
//!
//! Based on SLAU319

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

pub mod ihex;
pub mod memory;
pub mod protocol;

use crate::protocol::{Command, ResponseError};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

/// Erase address for the main memory area.
pub const MAIN_MEMORY_ADDRESS: u16 = 0xFFFE;
/// Base address of the information memory.
pub const INFORMATION_MEMORY_ADDRESS: u16 = 0x1000;
/// Information memory segment A, which usually holds factory calibration data.
pub const SEGMENT_A_ADDRESS: u16 = 0x10C0;
/// Information memory segment B.
pub const SEGMENT_B_ADDRESS: u16 = 0x1080;
/// Information memory segment C.
pub const SEGMENT_C_ADDRESS: u16 = 0x1040;
/// Information memory segment D.
pub const SEGMENT_D_ADDRESS: u16 = 0x1000;

/// Location of the chip identifier word.
pub const CHIP_ID_ADDRESS: u16 = 0x0FF0;
/// Location of the BSL firmware version word.
pub const BSL_VERSION_ADDRESS: u16 = 0x0FFA;

/// Serial port as required by the BSL: byte I/O plus the two control lines
/// driving the entry sequence (~RST on DTR, TEST on RTS) and mid-session
/// baud rate changes.
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
    fn set_baud_rate(&mut self, baud: usize) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("serial transport error: {0:?}")]
    Serial(E),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("device reported NACK")]
    Nack,

    #[error("unexpected response header 0x{0:02x}")]
    UnexpectedHeader(u8),

    #[error("duplicated length fields disagree")]
    LengthFieldMismatch,

    #[error("response length field does not match the received size")]
    LengthMismatch,

    #[error("response checksum mismatch")]
    ChecksumMismatch,

    #[error("address 0x{0:04x} is not word aligned")]
    UnalignedAddress(u16),

    #[error("block size {0} is invalid, must be even and at most 250")]
    InvalidBlockSize(usize),

    #[error("password must be exactly 32 bytes, got {0}")]
    InvalidPasswordLength(usize),

    #[error("memory range exceeds the 16-bit address space")]
    AddressRange,
}

impl<E: Debug> From<ResponseError> for Error<E> {
    fn from(e: ResponseError) -> Self {
        match e {
            ResponseError::Nack => Error::Nack,
            ResponseError::Header(b) => Error::UnexpectedHeader(b),
            ResponseError::LengthFields => Error::LengthFieldMismatch,
            ResponseError::Length => Error::LengthMismatch,
            ResponseError::Checksum => Error::ChecksumMismatch,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not drive the BSL entry sequence on the control lines
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for BSL responses in milliseconds
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for BSL responses in milliseconds
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait after the entry sequence before synchronizing
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "250"))]
    pub entry_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            entry_delay_ms: 250,
        }
    }
}

/// Baud rates the ChangeBaudrate command can select.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BslBaudrate {
    Baud9600,
    Baud19200,
    Baud38400,
}

impl BslBaudrate {
    /// Selector code carried in the command payload.
    fn selector(self) -> u8 {
        match self {
            BslBaudrate::Baud9600 => 0x00,
            BslBaudrate::Baud19200 => 0x01,
            BslBaudrate::Baud38400 => 0x02,
        }
    }

    /// Host-side line speed matching the selector.
    pub fn speed(self) -> usize {
        match self {
            BslBaudrate::Baud9600 => 9600,
            BslBaudrate::Baud19200 => 19200,
            BslBaudrate::Baud38400 => 38400,
        }
    }
}

/// Clock register values and target rate for the ChangeBaudrate command.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct BaudrateSettings {
    pub clock_register_0: u8,
    pub clock_register_1: u8,
    pub baudrate: BslBaudrate,
}

impl BaudrateSettings {
    /// Clock tuning the F1xx ROM expects for 38400 baud.
    pub const HIGH_SPEED: BaudrateSettings = BaudrateSettings {
        clock_register_0: 0x80,
        clock_register_1: 0x8C,
        baudrate: BslBaudrate::Baud38400,
    };
}

/// Memory sections selectable for erasure.
#[derive(Copy, Clone, Default, PartialEq, Debug)]
pub struct MemorySections {
    pub main_memory: bool,
    pub information_memory: bool,
    pub segment_a: bool,
}

impl MemorySections {
    /// Everything, segment A included.
    pub const ALL: MemorySections = MemorySections {
        main_memory: true,
        information_memory: true,
        segment_a: true,
    };
}

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    chip_id: u16,
    bsl_version: u16,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            chip_id: 0,
            bsl_version: 0,
            _err: PhantomData,
        }
    }

    /// Chip identifier, 0 until `init` has read it.
    pub fn chip_id(&self) -> u16 {
        self.chip_id
    }

    /// BSL firmware version, 0 until `init` has read it.
    pub fn bsl_version(&self) -> u16 {
        self.bsl_version
    }

    /// Send the synchronization character and wait for the device ACK.
    ///
    /// The device must answer a lone 0x80 with 0x90 before it accepts the
    /// framed command that follows, so every command starts here.
    pub fn synchronize(&mut self) -> Result<(), Error<E>> {
        self.write_all(&[protocol::SYNC])?;
        self.read_ack()
    }

    /// Send the 32 byte protection password.
    pub fn send_password(&mut self, password: &[u8]) -> Result<(), Error<E>> {
        if password.len() != protocol::PASSWORD_SIZE {
            return Err(Error::InvalidPasswordLength(password.len()));
        }

        debug!("Sending password");

        // The ROM declares a length of 24 here and does not count the
        // password bytes that follow the sub-header.
        let frame = protocol::build_request(Command::RxPassword, 0x18, [0x00; 4], password);
        self.command_ack(&frame)
    }

    /// Write a block of up to 250 bytes to device memory.
    pub fn write_block(&mut self, address: u16, data: &[u8]) -> Result<(), Error<E>> {
        if address % 2 != 0 {
            return Err(Error::UnalignedAddress(address));
        }
        if data.len() % 2 != 0 || data.len() > protocol::MAX_BLOCK_SIZE {
            return Err(Error::InvalidBlockSize(data.len()));
        }

        debug!("Writing {} bytes at 0x{:04x}", data.len(), address);

        let sub_header = [address as u8, (address >> 8) as u8, data.len() as u8, 0x00];
        let frame = protocol::build_request(
            Command::RxDataBlock,
            (4 + data.len()) as u8,
            sub_header,
            data,
        );
        self.command_ack(&frame)
    }

    /// Read a block of up to 250 bytes from device memory.
    ///
    /// The length must be even and non-zero.
    pub fn read_block(&mut self, address: u16, length: usize) -> Result<Vec<u8>, Error<E>> {
        if address % 2 != 0 {
            return Err(Error::UnalignedAddress(address));
        }
        if length == 0 || length % 2 != 0 || length > protocol::MAX_BLOCK_SIZE {
            return Err(Error::InvalidBlockSize(length));
        }

        debug!("Reading {} bytes at 0x{:04x}", length, address);

        let sub_header = [address as u8, (address >> 8) as u8, length as u8, 0x00];
        let frame = protocol::build_request(Command::TxDataBlock, 4, sub_header, &[]);

        self.synchronize()?;
        self.write_all(&frame)?;

        let mut response = vec![0u8; protocol::DATA_RESPONSE_OVERHEAD + length];
        response[0] = self.read_byte()?;
        if response[0] == protocol::SYNC {
            self.read_exact(&mut response[1..])?;
        }

        Ok(protocol::validate_data_response(&response)?.to_vec())
    }

    /// Erase the single segment containing `address`.
    pub fn erase_segment(&mut self, address: u16) -> Result<(), Error<E>> {
        if address % 2 != 0 {
            return Err(Error::UnalignedAddress(address));
        }

        debug!("Erasing segment at 0x{:04x}", address);

        let sub_header = [
            address as u8,
            (address >> 8) as u8,
            protocol::MODE_SEGMENT_ERASE,
            protocol::ERASE_KEY,
        ];
        let frame = protocol::build_request(Command::Erase, 4, sub_header, &[]);
        self.command_ack(&frame)
    }

    /// Erase the main or information memory area containing `address`.
    pub fn erase_main_info(&mut self, address: u16) -> Result<(), Error<E>> {
        if address % 2 != 0 {
            return Err(Error::UnalignedAddress(address));
        }

        debug!("Erasing memory area at 0x{:04x}", address);

        let sub_header = [
            address as u8,
            (address >> 8) as u8,
            protocol::MODE_MAIN_ERASE,
            protocol::ERASE_KEY,
        ];
        let frame = protocol::build_request(Command::Erase, 4, sub_header, &[]);
        self.command_ack(&frame)
    }

    /// Erase all of flash, main and information memory both.
    pub fn mass_erase(&mut self) -> Result<(), Error<E>> {
        debug!("Mass erasing");

        let sub_header = [0x00, 0x00, protocol::MODE_MAIN_ERASE, protocol::ERASE_KEY];
        let frame = protocol::build_request(Command::MassErase, 4, sub_header, &[]);
        self.command_ack(&frame)
    }

    /// Switch the device UART to another baud rate.
    ///
    /// Only the device changes speed; on success the caller must retune the
    /// local port to match before the next command.
    pub fn change_baudrate(&mut self, settings: BaudrateSettings) -> Result<(), Error<E>> {
        debug!("Changing device baudrate to {}", settings.baudrate.speed());

        let sub_header = [
            settings.clock_register_0,
            settings.clock_register_1,
            settings.baudrate.selector(),
            0x00,
        ];
        let frame = protocol::build_request(Command::ChangeBaudrate, 4, sub_header, &[]);
        self.command_ack(&frame)
    }

    /// Set the memory offset for devices with more than 64k of address space.
    pub fn set_mem_offset(&mut self, offset: u16) -> Result<(), Error<E>> {
        if offset % 2 != 0 {
            return Err(Error::UnalignedAddress(offset));
        }

        debug!("Setting memory offset to 0x{:04x}", offset);

        let sub_header = [0x00, 0x00, offset as u8, (offset >> 8) as u8];
        let frame = protocol::build_request(Command::SetMemOffset, 4, sub_header, &[]);
        self.command_ack(&frame)
    }

    /// Load the program counter and start execution at `address`.
    pub fn load_pc(&mut self, address: u16) -> Result<(), Error<E>> {
        if address % 2 != 0 {
            return Err(Error::UnalignedAddress(address));
        }

        debug!("Loading program counter with 0x{:04x}", address);

        let sub_header = [address as u8, (address >> 8) as u8, 0x00, 0x00];
        let frame = protocol::build_request(Command::LoadPc, 4, sub_header, &[]);
        self.command_ack(&frame)
    }

    /// Bring the device up into the BSL and prepare it for programming.
    ///
    /// Drives the entry sequence on the control lines, synchronizes, unlocks
    /// with the password when one is given, raises the link to 38400 baud and
    /// reads out the chip identity. The first failing step aborts the rest.
    pub fn init(&mut self, password: Option<&[u8]>) -> Result<(), Error<E>> {
        if !self.options.no_reset {
            debug!("Driving BSL entry sequence");

            // ~RST and TEST low, two TEST pulses, release ~RST on the
            // second one, then TEST low again.
            self.port.set_dtr(false).map_err(Error::Serial)?;
            self.port.set_rts(false).map_err(Error::Serial)?;
            self.port.set_rts(true).map_err(Error::Serial)?;
            self.port.set_rts(false).map_err(Error::Serial)?;
            self.port.set_rts(true).map_err(Error::Serial)?;
            self.port.set_dtr(true).map_err(Error::Serial)?;
            self.port.set_rts(false).map_err(Error::Serial)?;

            self.delay.delay_ms(self.options.entry_delay_ms);
        }

        debug!("Synchronizing with the BSL");
        self.synchronize()?;

        if let Some(password) = password {
            if let Err(e) = self.send_password(password) {
                warn!("Sending password failed, device is possibly mass erased");
                return Err(e);
            }
        }

        self.change_baudrate(BaudrateSettings::HIGH_SPEED)?;
        self.port
            .set_baud_rate(BaudrateSettings::HIGH_SPEED.baudrate.speed())
            .map_err(Error::Serial)?;

        let chip_id = self.read_block(CHIP_ID_ADDRESS, 2)?;
        self.chip_id = u16::from(chip_id[0]) << 8 | u16::from(chip_id[1]);

        let version = self.read_block(BSL_VERSION_ADDRESS, 2)?;
        self.bsl_version = u16::from(version[0]) << 8 | u16::from(version[1]);

        debug!(
            "Connected, chip id 0x{:04x}, BSL version 0x{:04x}",
            self.chip_id, self.bsl_version
        );

        Ok(())
    }

    /// Release the device from the BSL by pulsing ~RST.
    ///
    /// No response is expected or read.
    pub fn terminate(&mut self) -> Result<(), Error<E>> {
        debug!("Releasing device from the BSL");

        self.port.set_dtr(false).map_err(Error::Serial)?;
        self.port.set_dtr(true).map_err(Error::Serial)
    }

    /// Read a memory range, in blocks of at most 250 bytes.
    ///
    /// Stops at the first failing block, leaving `data` partially filled.
    pub fn read_mem(&mut self, address: u16, data: &mut [u8]) -> Result<(), Error<E>> {
        if usize::from(address) + data.len() > 0x1_0000 {
            return Err(Error::AddressRange);
        }

        let mut offset = 0;
        for chunk in data.chunks_mut(protocol::MAX_BLOCK_SIZE) {
            let block = self.read_block(address + offset as u16, chunk.len())?;
            chunk.copy_from_slice(&block);
            offset += chunk.len();
        }

        Ok(())
    }

    /// Write a memory range, in blocks of at most 250 bytes.
    ///
    /// Stops at the first failing block; already written blocks are not
    /// rolled back.
    pub fn write_mem(&mut self, address: u16, data: &[u8]) -> Result<(), Error<E>> {
        if usize::from(address) + data.len() > 0x1_0000 {
            return Err(Error::AddressRange);
        }

        let mut offset = 0;
        for chunk in data.chunks(protocol::MAX_BLOCK_SIZE) {
            self.write_block(address + offset as u16, chunk)?;
            offset += chunk.len();
        }

        Ok(())
    }

    /// Erase the selected memory sections.
    ///
    /// All three together collapse into a single mass erase. Without
    /// `segment_a` the information memory is erased segment by segment,
    /// preserving the calibration data in segment A. Stops at the first
    /// failing erase.
    pub fn erase_mem(&mut self, sections: MemorySections) -> Result<(), Error<E>> {
        if sections.main_memory && sections.information_memory && sections.segment_a {
            return self.mass_erase();
        }

        if sections.main_memory {
            self.erase_main_info(MAIN_MEMORY_ADDRESS)?;
        }

        if sections.information_memory {
            if sections.segment_a {
                self.erase_main_info(INFORMATION_MEMORY_ADDRESS)?;
            } else {
                self.erase_segment(SEGMENT_B_ADDRESS)?;
                self.erase_segment(SEGMENT_C_ADDRESS)?;
                self.erase_segment(SEGMENT_D_ADDRESS)?;
            }
        }

        Ok(())
    }

    fn command_ack(&mut self, frame: &[u8]) -> Result<(), Error<E>> {
        self.synchronize()?;
        self.write_all(frame)?;
        self.read_ack()
    }

    fn read_ack(&mut self) -> Result<(), Error<E>> {
        let byte = self.read_byte()?;
        protocol::parse_ack(byte)?;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for byte in data {
            block!(self.port.write(*byte)).map_err(Error::Serial)?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let mut waited = 0;

        loop {
            match self.port.read() {
                Ok(byte) => return Ok(byte),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            waited += self.options.poll_delay_ms;

            if waited > self.options.response_timeout_ms {
                return Err(Error::Timeout);
            }
        }
    }

    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), Error<E>> {
        for slot in data {
            *slot = self.read_byte()?;
        }
        Ok(())
    }
}
