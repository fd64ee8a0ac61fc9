//! Supported device platforms and their per-variant behavior.

use serde::{Deserialize, Serialize};

/// How a platform's configuration is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// SSH terminal session, one show command.
    Cli,
    /// HTTPS management API.
    Api,
}

/// Network device platform.
///
/// Adding a platform is a compile-checked change: the match arms below cover
/// the show command, the transport class, and the scrub rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Cisco IOS / IOS-XE
    Ios,
    /// Cisco NX-OS
    Nxos,
    /// Arista EOS
    Eos,
    /// Dell OS10
    DellOs10,
    /// Palo Alto Networks PAN-OS
    Panos,
    /// Fortinet FortiOS
    Fortios,
}

impl Platform {
    /// Stable identifier, matching the inventory column values.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Nxos => "nxos",
            Self::Eos => "eos",
            Self::DellOs10 => "dellos10",
            Self::Panos => "panos",
            Self::Fortios => "fortios",
        }
    }

    /// Parse an inventory column value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ios" => Some(Self::Ios),
            "nxos" => Some(Self::Nxos),
            "eos" => Some(Self::Eos),
            "dellos10" => Some(Self::DellOs10),
            "panos" => Some(Self::Panos),
            "fortios" => Some(Self::Fortios),
            _ => None,
        }
    }

    /// Transport class used by the orchestrator to partition a job.
    pub fn transport(&self) -> Transport {
        match self {
            Self::Ios | Self::Nxos | Self::Eos | Self::DellOs10 => Transport::Cli,
            Self::Panos | Self::Fortios => Transport::Api,
        }
    }

    /// The one command a terminal worker issues.
    ///
    /// API platforms have no terminal command.
    pub fn show_command(&self) -> Option<&'static str> {
        match self {
            Self::Ios | Self::Nxos | Self::Eos => Some("show running-config"),
            Self::DellOs10 => Some("show running-configuration"),
            Self::Panos | Self::Fortios => None,
        }
    }

    /// Paging must be off before the show command or the prompt never
    /// returns on long configs.
    pub fn paging_command(&self) -> Option<&'static str> {
        match self.transport() {
            Transport::Cli => Some("terminal length 0"),
            Transport::Api => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown platform: {s}"))
    }
}
