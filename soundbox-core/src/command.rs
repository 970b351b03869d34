//! Command codes understood by the sound-box wire protocol.
//!
//! Uses proper enums with `TryFrom` — no panics on unknown bytes.

use crate::error::EngineError;
use std::fmt;

// ── Command ──────────────────────────────────────────────────────

/// All command codes in the device protocol.
///
/// Organized by family:
/// - `0x00..0x02` — Session (activation, login, heartbeat)
/// - `0x10..0x11` — Device control (reboot, factory reset)
/// - `0x20..0x25` — Scheduling (timed alarms, delayed actions)
/// - `0xA0..0xA3` — File transfer, reliable push path
/// - `0xB0..0xB3` — File transfer, self-fetch notify path
/// - `0xF0..0xF9` — Playback control
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // ── Session ──────────────────────────────────────────────────
    /// First-boot activation exchange.
    Activation = 0x00,
    /// Authenticated login handshake.
    Login = 0x01,
    /// Periodic liveness frame.
    Heartbeat = 0x02,

    // ── Device control ───────────────────────────────────────────
    Reboot = 0x10,
    FactoryReset = 0x11,

    // ── Scheduling ───────────────────────────────────────────────
    /// Repeat-window playback setting.
    LoopWhile = 0x20,
    /// Install a cron-style timed alarm.
    SetTimingAlarm = 0x21,
    /// Install a one-shot delayed action.
    SetTimingAfter = 0x22,
    /// Query the active timing mode.
    QueryTimingMode = 0x23,
    /// Query the installed timing entries.
    QueryTimingSet = 0x24,
    /// Schedule execution report from the device.
    TimingReport = 0x25,

    // ── File transfer, reliable push ─────────────────────────────
    /// Announce an upcoming file (index + package count).
    FileTransReq = 0xA0,
    /// One checksummed package; length field carries the package index.
    FileTransProc = 0xA1,
    /// Negative acknowledgement from the device.
    FileTransErr = 0xA2,
    /// End-of-file / all-files-complete report.
    FileTransRpt = 0xA3,

    // ── File transfer, self-fetch notify ─────────────────────────
    /// Hand the device a short token it resolves over HTTP.
    FileTransReqCell = 0xB0,
    /// Completion report for a self-fetched file.
    FileTransRptCell = 0xB3,

    // ── Playback ─────────────────────────────────────────────────
    Play = 0xF0,
    Pause = 0xF1,
    Next = 0xF2,
    Previous = 0xF3,
    Volume = 0xF4,
    FastForward = 0xF5,
    FastBackward = 0xF6,
    PlayIndex = 0xF7,
    ReadFilesList = 0xF8,
    DeleteFile = 0xF9,
}

impl TryFrom<u8> for Command {
    type Error = EngineError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Command::Activation),
            0x01 => Ok(Command::Login),
            0x02 => Ok(Command::Heartbeat),

            0x10 => Ok(Command::Reboot),
            0x11 => Ok(Command::FactoryReset),

            0x20 => Ok(Command::LoopWhile),
            0x21 => Ok(Command::SetTimingAlarm),
            0x22 => Ok(Command::SetTimingAfter),
            0x23 => Ok(Command::QueryTimingMode),
            0x24 => Ok(Command::QueryTimingSet),
            0x25 => Ok(Command::TimingReport),

            0xA0 => Ok(Command::FileTransReq),
            0xA1 => Ok(Command::FileTransProc),
            0xA2 => Ok(Command::FileTransErr),
            0xA3 => Ok(Command::FileTransRpt),

            0xB0 => Ok(Command::FileTransReqCell),
            0xB3 => Ok(Command::FileTransRptCell),

            0xF0 => Ok(Command::Play),
            0xF1 => Ok(Command::Pause),
            0xF2 => Ok(Command::Next),
            0xF3 => Ok(Command::Previous),
            0xF4 => Ok(Command::Volume),
            0xF5 => Ok(Command::FastForward),
            0xF6 => Ok(Command::FastBackward),
            0xF7 => Ok(Command::PlayIndex),
            0xF8 => Ok(Command::ReadFilesList),
            0xF9 => Ok(Command::DeleteFile),

            other => Err(EngineError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── DeviceClass ──────────────────────────────────────────────────

/// Hardware class reported in the last byte of the login payload.
///
/// Determines the file-transfer transport: Wi-Fi devices take the
/// reliable push path, cellular devices self-fetch over HTTP.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    WifiTest = 0x01,
    CellularTest = 0x11,
}

impl DeviceClass {
    /// True when the device retrieves files itself instead of taking
    /// the chunked push path.
    pub fn is_self_fetch(&self) -> bool {
        matches!(self, DeviceClass::CellularTest)
    }
}

impl TryFrom<u8> for DeviceClass {
    type Error = EngineError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DeviceClass::WifiTest),
            0x11 => Ok(DeviceClass::CellularTest),
            _ => Err(EngineError::LoginRejected("unknown device class")),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
