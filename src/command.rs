//! Commands left for the second-stage bootloader
//!
//! A successful update ends with a [StagingCommand] that tells the bootloader
//! to copy the staged image over its final location on the next restart. The
//! record is protected by a magic value and a CRC-32/MPEG-2 so that a torn
//! write is ignored rather than executed.

use std::{fmt, mem::size_of};

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use crc::{Crc, CRC_32_MPEG_2};
use strum::{Display, FromRepr};

use crate::error::{CommandError, FlashError};

/// Magic value marking a valid command
pub const EBOOT_MAGIC: u32 = 0xEB00_1000;
/// Bits of the magic value that identify the record
pub const EBOOT_MAGIC_MASK: u32 = 0xFFFF_F000;

const EBOOT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Actions understood by the bootloader
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u32)]
pub enum Action {
    /// Copy `args[2]` bytes from `args[0]` to `args[1]`, then boot
    CopyRaw = 0x0000_0001,
    /// Boot the application
    LoadApp = 0xFFFF_FFFF,
}

/// The persisted command record
#[derive(Copy, Clone, Zeroable, Pod, PartialEq, Eq)]
#[repr(C)]
pub struct StagingCommand {
    magic: u32,
    action: u32,
    args: [u32; 29],
    crc32: u32,
}

impl StagingCommand {
    pub const LEN: usize = size_of::<StagingCommand>();

    /// A command copying `length` bytes from `source` to `destination`
    pub fn copy_raw(source: u32, destination: u32, length: u32) -> Self {
        let mut args = [0u32; 29];
        args[..3].copy_from_slice(&[source, destination, length]);

        Self::new(Action::CopyRaw, args)
    }

    fn new(action: Action, args: [u32; 29]) -> Self {
        let mut command = StagingCommand {
            magic: EBOOT_MAGIC,
            action: action as u32,
            args,
            crc32: 0,
        };
        command.crc32 = command.calculate_crc32();
        command
    }

    /// Decode and validate a persisted record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CommandError> {
        if bytes.len() != Self::LEN {
            return Err(CommandError::Length {
                expected: Self::LEN,
                got: bytes.len(),
            });
        }

        let command: StagingCommand = pod_read_unaligned(bytes);
        if command.magic & EBOOT_MAGIC_MASK != EBOOT_MAGIC {
            return Err(CommandError::Magic(command.magic));
        }

        let computed = command.calculate_crc32();
        if computed != command.crc32 {
            return Err(CommandError::Crc {
                stored: command.crc32,
                computed,
            });
        }

        Ok(command)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytes_of(self)
    }

    /// The action, `None` if the bootloader would not recognize it
    pub fn action(&self) -> Option<Action> {
        Action::from_repr(self.action)
    }

    pub fn source(&self) -> u32 {
        self.args[0]
    }

    pub fn destination(&self) -> u32 {
        self.args[1]
    }

    pub fn length(&self) -> u32 {
        self.args[2]
    }

    fn calculate_crc32(&self) -> u32 {
        let bytes = bytes_of(self);
        EBOOT_CRC.checksum(&bytes[..Self::LEN - size_of::<u32>()])
    }
}

impl fmt::Debug for StagingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingCommand")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("action", &self.action())
            .field("source", &format_args!("{:#x}", self.source()))
            .field("destination", &format_args!("{:#x}", self.destination()))
            .field("length", &self.length())
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .finish()
    }
}

impl fmt::Display for StagingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action() {
            Some(Action::CopyRaw) => write!(
                f,
                "copy {:#x} bytes from {:#010x} to {:#010x}",
                self.length(),
                self.source(),
                self.destination()
            ),
            Some(action) => write!(f, "{action}"),
            None => write!(f, "unknown action {:#010x}", self.action),
        }
    }
}

/// Where staging commands are persisted for the bootloader
pub trait CommandStore {
    fn write_command(&mut self, command: &StagingCommand) -> Result<(), FlashError>;
}

/// [CommandStore] keeping the last command in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryCommandStore {
    command: Option<StagingCommand>,
    writes: usize,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(&self) -> Option<&StagingCommand> {
        self.command.as_ref()
    }

    /// Number of commands written so far
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn take(&mut self) -> Option<StagingCommand> {
        self.command.take()
    }
}

impl CommandStore for MemoryCommandStore {
    fn write_command(&mut self, command: &StagingCommand) -> Result<(), FlashError> {
        self.command = Some(*command);
        self.writes += 1;
        Ok(())
    }
}
