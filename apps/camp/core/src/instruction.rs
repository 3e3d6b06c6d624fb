use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of work a soldier knows how to perform.
///
/// The integer codes are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum InstructionType {
    Command,
    BrowserInspect,
    Dns,
    Http,
    Icmp,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown instruction type {0}")]
pub struct UnknownInstructionType(pub i32);

impl InstructionType {
    pub const ALL: [InstructionType; 5] = [
        InstructionType::Command,
        InstructionType::BrowserInspect,
        InstructionType::Dns,
        InstructionType::Http,
        InstructionType::Icmp,
    ];

    pub fn code(self) -> i32 {
        match self {
            InstructionType::Command => 1,
            InstructionType::BrowserInspect => 2,
            InstructionType::Dns => 3,
            InstructionType::Http => 4,
            InstructionType::Icmp => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstructionType::Command => "command",
            InstructionType::BrowserInspect => "browser_inspect",
            InstructionType::Dns => "dns",
            InstructionType::Http => "http",
            InstructionType::Icmp => "icmp",
        }
    }
}

impl TryFrom<i32> for InstructionType {
    type Error = UnknownInstructionType;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        InstructionType::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(UnknownInstructionType(code))
    }
}

impl From<InstructionType> for i32 {
    fn from(kind: InstructionType) -> Self {
        kind.code()
    }
}

impl fmt::Display for InstructionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work as carried inside an `Instruct` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionRequest {
    pub uuid: String,
    pub kind: InstructionType,
    /// Shell string, URL, domain or address depending on `kind`.
    pub content: String,
}

impl InstructionRequest {
    pub fn new(kind: InstructionType, content: impl Into<String>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
        }
    }
}
