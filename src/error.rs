//! Library and application errors

use miette::Diagnostic;
use thiserror::Error;

/// All possible errors returned by an update session
///
/// Every variant except the caller-misuse ones ([Error::AlreadyRunning],
/// [Error::NotRunning], [Error::InvalidMd5], [Error::UnknownTarget]) is fatal
/// to the session: it is recorded, reported to the observer, and the session
/// is torn down before the error is handed back.
#[derive(Clone, Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("Flash Write Failed")]
    #[diagnostic(code(esp_updater::write_failed))]
    WriteFailed,

    #[error("Flash Erase Failed")]
    #[diagnostic(code(esp_updater::erase_failed))]
    EraseFailed,

    #[error("Flash Read Failed")]
    #[diagnostic(code(esp_updater::read_failed))]
    ReadFailed,

    #[error("Not Enough Space")]
    #[diagnostic(
        code(esp_updater::no_space),
        help("The new image must fit between the running image and the end of the update region")
    )]
    NoSpace,

    #[error("Bad Size Given")]
    #[diagnostic(code(esp_updater::bad_size))]
    BadSize,

    #[error("Stream Read Timeout")]
    #[diagnostic(code(esp_updater::stream_timeout))]
    StreamTimeout,

    #[error("MD5 verification failed: expected: {expected}, calculated: {calculated}")]
    #[diagnostic(code(esp_updater::md5_mismatch))]
    Md5Mismatch { expected: String, calculated: String },

    #[error("Flash config wrong: real: {real}, SDK: {configured}")]
    #[diagnostic(
        code(esp_updater::flash_config),
        help("The configured flash size must not exceed the size of the attached flash chip")
    )]
    FlashConfig { real: u32, configured: u32 },

    #[error("new Flash config wrong, real size: {real}")]
    #[diagnostic(
        code(esp_updater::new_flash_config),
        help("The image header declares a flash chip larger than the one attached")
    )]
    NewFlashConfig { real: u32 },

    #[error("Magic byte is not 0xE9")]
    #[diagnostic(code(esp_updater::magic_byte))]
    MagicByte,

    #[error("Invalid bootstrapping state, reset ESP8266 before updating")]
    #[diagnostic(
        code(esp_updater::bootstrap),
        help("The device was strapped into UART download mode and cannot restart into the new image")
    )]
    InvalidBootstrap,

    #[error("Signature verification failed")]
    #[diagnostic(code(esp_updater::signature))]
    SignatureFailed,

    #[error("No data supplied")]
    #[diagnostic(code(esp_updater::no_data))]
    NoData,

    #[error("Out of memory")]
    #[diagnostic(code(esp_updater::out_of_memory))]
    OutOfMemory,

    #[error("Update incomplete: {written} of {expected} bytes written")]
    #[diagnostic(
        code(esp_updater::incomplete),
        help("Call `end(true)` to stage an image of unknown size")
    )]
    Incomplete { written: u32, expected: u32 },

    #[error("An update is already running")]
    #[diagnostic(code(esp_updater::already_running))]
    AlreadyRunning,

    #[error("No update is running")]
    #[diagnostic(code(esp_updater::not_running))]
    NotRunning,

    #[error("Expected an MD5 digest of 32 hex characters, received {0} characters")]
    #[diagnostic(code(esp_updater::invalid_md5))]
    InvalidMd5(usize),

    #[error("Unknown update command: {0}")]
    #[diagnostic(
        code(esp_updater::unknown_target),
        help("Supported commands are 0 (application) and 100 (filesystem)")
    )]
    UnknownTarget(u32),
}

impl Error {
    /// The numeric code reported for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::WriteFailed => ErrorCode::Write,
            Error::EraseFailed => ErrorCode::Erase,
            Error::ReadFailed => ErrorCode::Read,
            Error::NoSpace => ErrorCode::Space,
            Error::BadSize => ErrorCode::Size,
            Error::StreamTimeout => ErrorCode::Stream,
            Error::Md5Mismatch { .. } => ErrorCode::Md5,
            Error::FlashConfig { .. } => ErrorCode::FlashConfig,
            Error::NewFlashConfig { .. } => ErrorCode::NewFlashConfig,
            Error::MagicByte => ErrorCode::MagicByte,
            Error::InvalidBootstrap => ErrorCode::Bootstrap,
            Error::SignatureFailed => ErrorCode::Sign,
            Error::NoData => ErrorCode::NoData,
            Error::OutOfMemory => ErrorCode::OutOfMemory,
            Error::Incomplete { .. } => ErrorCode::Incomplete,
            Error::AlreadyRunning
            | Error::NotRunning
            | Error::InvalidMd5(_)
            | Error::UnknownTarget(_) => ErrorCode::Unknown,
        }
    }
}

/// Numeric error codes, stable across releases
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
#[non_exhaustive]
pub enum ErrorCode {
    Ok = 0,
    Write = 1,
    Erase = 2,
    Read = 3,
    Space = 4,
    Size = 5,
    Stream = 6,
    Md5 = 7,
    FlashConfig = 8,
    NewFlashConfig = 9,
    MagicByte = 10,
    Bootstrap = 11,
    Sign = 12,
    NoData = 13,
    OutOfMemory = 14,
    Incomplete = 15,
    #[default]
    Unknown = 0xff,
}

impl From<u8> for ErrorCode {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// Errors reported by a flash device
#[derive(Clone, Copy, Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FlashError {
    #[error("Failed to erase flash sector {0}")]
    #[diagnostic(code(esp_updater::flash::erase))]
    Erase(u32),

    #[error("Failed to write {len} bytes at {addr:#x}")]
    #[diagnostic(code(esp_updater::flash::write))]
    Write { addr: u32, len: usize },

    #[error("Failed to read {len} bytes at {addr:#x}")]
    #[diagnostic(code(esp_updater::flash::read))]
    Read { addr: u32, len: usize },

    #[error("Range {addr:#x}+{len:#x} lies outside of the flash")]
    #[diagnostic(code(esp_updater::flash::out_of_range))]
    OutOfRange { addr: u32, len: usize },
}

/// Errors decoding a persisted staging command
#[derive(Clone, Copy, Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandError {
    #[error("Invalid staging command length, expected {expected}, got {got}")]
    #[diagnostic(code(esp_updater::command::length))]
    Length { expected: usize, got: usize },

    #[error("Unrecognized staging command magic: {0:#010x}")]
    #[diagnostic(
        code(esp_updater::command::magic),
        help("The record was not written by the updater, or has been cleared by the bootloader")
    )]
    Magic(u32),

    #[error("Staging command CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    #[diagnostic(code(esp_updater::command::crc))]
    Crc { stored: u32, computed: u32 },
}

/// Errors in the command-line configuration file
#[cfg(feature = "cli")]
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Misplaced configuration keys: {0}")]
    #[diagnostic(
        code(esp_updater::config::misplaced_key),
        help("Move the keys into the section named in the message")
    )]
    MisplacedKey(String),

    #[error("Unknown configuration keys: {0}")]
    #[diagnostic(
        code(esp_updater::config::unknown_key),
        help("Known sections are [layout] and [stream]")
    )]
    UnknownKey(String),

    #[error("Failed to parse configuration file")]
    #[diagnostic(code(esp_updater::config::parse))]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_u8() {
        for error in [
            Error::WriteFailed,
            Error::NoSpace,
            Error::MagicByte,
            Error::NoData,
            Error::Incomplete {
                written: 1,
                expected: 2,
            },
        ] {
            let code = error.code();
            assert_eq!(ErrorCode::from(code as u8), code);
        }
    }

    #[test]
    fn unknown_raw_code_maps_to_unknown() {
        assert_eq!(ErrorCode::from(42), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from(0), ErrorCode::Ok);
    }

    #[test]
    fn md5_mismatch_mentions_both_digests() {
        let error = Error::Md5Mismatch {
            expected: "00".repeat(16),
            calculated: "ff".repeat(16),
        };
        let text = error.to_string();

        assert!(text.contains(&"00".repeat(16)));
        assert!(text.contains(&"ff".repeat(16)));
    }
}
