//! Access modes: the two-character codes selecting how a node's CRM runs
//! and which lock flavor guards it.

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NoodleError;

/// Where the CRM runs: in the caller's process or in a spawned child
/// process reached over in-memory RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    #[serde(rename = "l")]
    Local,
    #[serde(rename = "p")]
    Process,
}

impl AccessLevel {
    pub const fn as_char(self) -> char {
        match self {
            Self::Local => 'l',
            Self::Process => 'p',
        }
    }

    pub fn from_char(c: char) -> Result<Self, NoodleError> {
        match c {
            'l' => Ok(Self::Local),
            'p' => Ok(Self::Process),
            other => Err(NoodleError::Validation(format!(
                "access level must be 'l' (local) or 'p' (process), got '{other}'"
            ))),
        }
    }
}

impl Display for AccessLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Reader or writer lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
}

impl LockKind {
    pub const fn as_char(self) -> char {
        match self {
            Self::Read => 'r',
            Self::Write => 'w',
        }
    }

    pub fn from_char(c: char) -> Result<Self, NoodleError> {
        match c {
            'r' => Ok(Self::Read),
            'w' => Ok(Self::Write),
            other => Err(NoodleError::Validation(format!(
                "lock type must be 'r' (read) or 'w' (write), got '{other}'"
            ))),
        }
    }
}

impl Display for LockKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl FromStr for LockKind {
    type Err = NoodleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c),
            _ => Err(NoodleError::Validation(format!(
                "lock type must be a single character, got '{s}'"
            ))),
        }
    }
}

/// A full access mode: `lr`, `lw`, `pr` or `pw`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccessMode {
    pub level: AccessLevel,
    pub kind: LockKind,
}

impl AccessMode {
    pub const fn new(level: AccessLevel, kind: LockKind) -> Self {
        Self { level, kind }
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.level, self.kind)
    }
}

impl FromStr for AccessMode {
    type Err = NoodleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(level), Some(kind), None) => Ok(Self {
                level: AccessLevel::from_char(level)?,
                kind: LockKind::from_char(kind)?,
            }),
            _ => Err(NoodleError::Validation(format!(
                "access mode must be one of 'lr', 'lw', 'pr', 'pw', got '{s}'"
            ))),
        }
    }
}
