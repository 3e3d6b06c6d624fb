use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::identity::AgentIdentity;
use crate::instruction::InstructionType;

/// Registry row for one connected soldier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub uuid: String,
    #[serde(flatten)]
    pub identity: AgentIdentity,
    pub client_ip: String,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub update_time: OffsetDateTime,
}

/// Tri-state result column of an instruction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum InstructionState {
    Pending,
    Completed,
    Failed,
}

impl InstructionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstructionState::Pending)
    }
}

impl From<InstructionState> for i8 {
    fn from(state: InstructionState) -> Self {
        match state {
            InstructionState::Pending => 0,
            InstructionState::Completed => 1,
            InstructionState::Failed => -1,
        }
    }
}

impl TryFrom<i8> for InstructionState {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InstructionState::Pending),
            1 => Ok(InstructionState::Completed),
            -1 => Ok(InstructionState::Failed),
            other => Err(format!("invalid instruction result {other}")),
        }
    }
}

/// Ledger row: one issued instruction and, eventually, its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionRecord {
    pub uuid: String,
    #[serde(flatten)]
    pub target: AgentIdentity,
    #[serde(rename = "type")]
    pub kind: InstructionType,
    pub content: String,
    pub result: InstructionState,
    #[serde(default)]
    pub reply: String,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub update_time: OffsetDateTime,
}

impl InstructionRecord {
    pub fn pending(
        uuid: impl Into<String>,
        target: AgentIdentity,
        kind: InstructionType,
        content: impl Into<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            target,
            kind,
            content: content.into(),
            result: InstructionState::Pending,
            reply: String::new(),
            create_time: now,
            update_time: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn record_json_shape() {
        let target = AgentIdentity::new("o", "g", "i").unwrap();
        let record = InstructionRecord::pending(
            "u",
            target,
            InstructionType::Icmp,
            "1.1.1.1",
            OffsetDateTime::UNIX_EPOCH,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["orgUuid"], "o");
        assert_eq!(json["instanceName"], "i");
        assert_eq!(json["type"], 5);
        assert_eq!(json["result"], 0);
        assert_eq!(json["createTime"], "1970-01-01T00:00:00Z");

        let back: InstructionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test_timeout::timeout]
    fn state_codes() {
        assert_eq!(i8::from(InstructionState::Failed), -1);
        assert_eq!(InstructionState::try_from(1), Ok(InstructionState::Completed));
        assert!(InstructionState::try_from(2).is_err());
        assert!(!InstructionState::Pending.is_terminal());
    }
}
