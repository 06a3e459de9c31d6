//! Control codes and command decoding.
//!
//! Codes follow the Windows `CTL_CODE` layout so they can be carried
//! unchanged over a device-control transport.

use std::fmt;

use crate::error::FilterError;

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_READ_DATA: u32 = 0x1;
const FILE_WRITE_DATA: u32 = 0x2;

pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const fn atf_code(function: u32) -> u32 {
    ctl_code(
        FILE_DEVICE_UNKNOWN,
        function,
        METHOD_BUFFERED,
        FILE_READ_DATA | FILE_WRITE_DATA,
    )
}

pub const IOCTL_ATF_SEND_KEEPALIVE: u32 = atf_code(0x800);
pub const IOCTL_ATF_SEND_WFP_CONFIG: u32 = atf_code(0x801);
pub const IOCTL_ATF_WFP_SERVICE_START: u32 = atf_code(0x802);
pub const IOCTL_ATF_WFP_SERVICE_STOP: u32 = atf_code(0x803);
pub const IOCTL_ATF_FLUSH_CONFIG: u32 = atf_code(0x804);
pub const IOCTL_ATF_APPEND_IPV4_BLACKLIST: u32 = atf_code(0x805);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Keepalive,
    LoadConfig,
    Start,
    Stop,
    Flush,
    AppendBlacklist,
}

impl CommandCode {
    pub const fn code(self) -> u32 {
        match self {
            CommandCode::Keepalive => IOCTL_ATF_SEND_KEEPALIVE,
            CommandCode::LoadConfig => IOCTL_ATF_SEND_WFP_CONFIG,
            CommandCode::Start => IOCTL_ATF_WFP_SERVICE_START,
            CommandCode::Stop => IOCTL_ATF_WFP_SERVICE_STOP,
            CommandCode::Flush => IOCTL_ATF_FLUSH_CONFIG,
            CommandCode::AppendBlacklist => IOCTL_ATF_APPEND_IPV4_BLACKLIST,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            IOCTL_ATF_SEND_KEEPALIVE => Some(CommandCode::Keepalive),
            IOCTL_ATF_SEND_WFP_CONFIG => Some(CommandCode::LoadConfig),
            IOCTL_ATF_WFP_SERVICE_START => Some(CommandCode::Start),
            IOCTL_ATF_WFP_SERVICE_STOP => Some(CommandCode::Stop),
            IOCTL_ATF_FLUSH_CONFIG => Some(CommandCode::Flush),
            IOCTL_ATF_APPEND_IPV4_BLACKLIST => Some(CommandCode::AppendBlacklist),
            _ => None,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandCode::Keepalive => "Keepalive",
            CommandCode::LoadConfig => "LoadConfig",
            CommandCode::Start => "Start",
            CommandCode::Stop => "Stop",
            CommandCode::Flush => "Flush",
            CommandCode::AppendBlacklist => "AppendBlacklist",
        })
    }
}

/// A decoded administrative command borrowing its input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Keepalive,
    LoadConfig(&'a [u8]),
    AppendBlacklist(&'a [u8]),
    Start,
    Stop,
    Flush,
}

impl<'a> Command<'a> {
    /// Decode a control code and its input buffer.
    ///
    /// Commands without a payload ignore `input`.
    pub fn decode(code: u32, input: &'a [u8]) -> Result<Self, FilterError> {
        let command = match CommandCode::from_code(code).ok_or(FilterError::UnknownCommand(code))? {
            CommandCode::Keepalive => Command::Keepalive,
            CommandCode::LoadConfig => Command::LoadConfig(input),
            CommandCode::AppendBlacklist => Command::AppendBlacklist(input),
            CommandCode::Start => Command::Start,
            CommandCode::Stop => Command::Stop,
            CommandCode::Flush => Command::Flush,
        };
        Ok(command)
    }

    pub fn code(&self) -> CommandCode {
        match self {
            Command::Keepalive => CommandCode::Keepalive,
            Command::LoadConfig(_) => CommandCode::LoadConfig,
            Command::AppendBlacklist(_) => CommandCode::AppendBlacklist,
            Command::Start => CommandCode::Start,
            Command::Stop => CommandCode::Stop,
            Command::Flush => CommandCode::Flush,
        }
    }
}
