//! Vehicle bus protocols and negotiation profiles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Vehicle bus protocols selectable with `ATSPn`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ObdProtocol {
    /// Adapter auto-detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    pub const ALL: [ObdProtocol; 10] = [
        ObdProtocol::Auto,
        ObdProtocol::J1850Pwm,
        ObdProtocol::J1850Vpw,
        ObdProtocol::Iso9141_2,
        ObdProtocol::Iso14230_4Kwp,
        ObdProtocol::Iso14230_4KwpFast,
        ObdProtocol::Iso15765_4Can11bit500,
        ObdProtocol::Iso15765_4Can29bit500,
        ObdProtocol::Iso15765_4Can11bit250,
        ObdProtocol::Iso15765_4Can29bit250,
    ];

    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::J1850Pwm => "ATSP1",
            ObdProtocol::J1850Vpw => "ATSP2",
            ObdProtocol::Iso9141_2 => "ATSP3",
            ObdProtocol::Iso14230_4Kwp => "ATSP4",
            ObdProtocol::Iso14230_4KwpFast => "ATSP5",
            ObdProtocol::Iso15765_4Can11bit500 => "ATSP6",
            ObdProtocol::Iso15765_4Can29bit500 => "ATSP7",
            ObdProtocol::Iso15765_4Can11bit250 => "ATSP8",
            ObdProtocol::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// Identifier recorded in metrics and accepted in configuration
    pub fn id(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "auto",
            ObdProtocol::J1850Pwm => "sae-j1850-p",
            ObdProtocol::J1850Vpw => "sae-j1850-v",
            ObdProtocol::Iso9141_2 => "iso9141-2",
            ObdProtocol::Iso14230_4Kwp => "kwp2000-5",
            ObdProtocol::Iso14230_4KwpFast => "kwp2000-f",
            ObdProtocol::Iso15765_4Can11bit500 => "iso15765-4",
            ObdProtocol::Iso15765_4Can29bit500 => "iso15765-5",
            ObdProtocol::Iso15765_4Can11bit250 => "iso15765-4-250",
            ObdProtocol::Iso15765_4Can29bit250 => "iso15765-5-250",
        }
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ObdProtocol {
    type Err = String;

    /// Accepts the identifier (`iso15765-4`), the AT command (`ATSP6`) or the digit (`6`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ObdProtocol::ALL
            .into_iter()
            .find(|p| {
                p.id() == wanted
                    || p.to_elm_command().eq_ignore_ascii_case(&wanted)
                    || p.to_elm_command()[4..] == wanted
            })
            .ok_or_else(|| format!("unknown protocol '{}'", s))
    }
}

/// Ranked candidate protocols for a vehicle family
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolProfile {
    pub name: &'static str,
    pub protocols: &'static [ObdProtocol],
    /// Extra, non-critical init commands
    pub init_commands: &'static [&'static str],
}

use ObdProtocol::*;

pub static PROFILES: &[ProtocolProfile] = &[
    ProtocolProfile {
        name: "auto",
        protocols: &[Auto],
        init_commands: &[],
    },
    ProtocolProfile {
        name: "toyota_lexus",
        protocols: &[Iso15765_4Can11bit500, Iso9141_2, Iso14230_4Kwp, Iso14230_4KwpFast],
        init_commands: &["ATCAF0"],
    },
    ProtocolProfile {
        name: "honda",
        protocols: &[Iso15765_4Can11bit500, Iso14230_4KwpFast],
        init_commands: &[],
    },
    ProtocolProfile {
        name: "nissan",
        protocols: &[Iso15765_4Can11bit500, Iso14230_4KwpFast, Iso9141_2],
        init_commands: &[],
    },
    ProtocolProfile {
        name: "gm",
        protocols: &[Iso15765_4Can11bit500, J1850Vpw],
        init_commands: &[],
    },
    ProtocolProfile {
        name: "ford",
        protocols: &[Iso15765_4Can11bit500, J1850Pwm],
        init_commands: &[],
    },
    ProtocolProfile {
        name: "european",
        protocols: &[Iso15765_4Can11bit500, Iso14230_4KwpFast, Iso9141_2],
        init_commands: &[],
    },
];

impl ProtocolProfile {
    /// Case-insensitive lookup; unknown names fall back to `auto`
    pub fn get(name: &str) -> &'static ProtocolProfile {
        let wanted = name.trim().to_ascii_lowercase();
        PROFILES
            .iter()
            .find(|p| p.name == wanted)
            .unwrap_or(&PROFILES[0])
    }

    pub fn auto() -> &'static ProtocolProfile {
        &PROFILES[0]
    }
}
