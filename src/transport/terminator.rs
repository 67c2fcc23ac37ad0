use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// End-of-string terminator appended to writes and scanned for on reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Terminator {
    /// `\r\n`
    CrLf,
    /// `\r`
    Cr,
    /// `\n`
    #[default]
    Lf,
    /// No terminator; reads rely on EOI or length.
    #[serde(rename = "none")]
    None,
}

impl Terminator {
    /// Bytes appended to writes.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Terminator::CrLf => b"\r\n",
            Terminator::Cr => b"\r",
            Terminator::Lf => b"\n",
            Terminator::None => b"",
        }
    }

    /// Code used by the Prologix `++eos` command.
    pub fn prologix_code(self) -> u8 {
        match self {
            Terminator::CrLf => 0,
            Terminator::Cr => 1,
            Terminator::Lf => 2,
            Terminator::None => 3,
        }
    }

    /// Terminator for a Prologix `++eos` code.
    pub fn from_prologix_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Terminator::CrLf),
            1 => Some(Terminator::Cr),
            2 => Some(Terminator::Lf),
            3 => Some(Terminator::None),
            _ => None,
        }
    }

    /// Strip one trailing terminator, if present.
    pub fn strip<'a>(self, data: &'a [u8]) -> &'a [u8] {
        data.strip_suffix(self.as_bytes()).unwrap_or(data)
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Terminator::CrLf => "CrLf",
            Terminator::Cr => "Cr",
            Terminator::Lf => "Lf",
            Terminator::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for Terminator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "\r\n" => return Ok(Terminator::CrLf),
            "\r" => return Ok(Terminator::Cr),
            "\n" => return Ok(Terminator::Lf),
            _ => {}
        }
        match s.trim().to_ascii_lowercase().as_str() {
            "crlf" => Ok(Terminator::CrLf),
            "cr" => Ok(Terminator::Cr),
            "lf" => Ok(Terminator::Lf),
            "none" | "" => Ok(Terminator::None),
            other => Err(format!("Unknown terminator '{}'", other)),
        }
    }
}
