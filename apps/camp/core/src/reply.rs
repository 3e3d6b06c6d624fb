use serde::{Deserialize, Deserializer, Serialize};

use crate::instruction::InstructionType;
use crate::wire::base64_bytes;

/// One network response observed while a page loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInspection {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub remote_port: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_disk_cache: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub security_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_details: Option<serde_json::Value>,
}

/// Result of loading a page in a browser: the document itself plus every
/// sub-resource it pulled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInspection {
    #[serde(rename = "Url", default)]
    pub url: String,
    #[serde(rename = "HomePageInspect", default)]
    pub home_page: ResourceInspection,
    #[serde(
        rename = "ResourcePageInspect",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub resources: Vec<ResourceInspection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpInspection {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub status_code: u16,
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub response: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Zone", default)]
    pub zone: String,
}

/// Echo statistics. Durations are nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IcmpStatistics {
    #[serde(default)]
    pub packets_recv: u32,
    #[serde(default)]
    pub packets_sent: u32,
    #[serde(default)]
    pub packets_recv_duplicates: u32,
    #[serde(default)]
    pub packet_loss: f64,
    #[serde(rename = "IPAddr", default)]
    pub ip_addr: Option<IpAddress>,
    #[serde(default)]
    pub addr: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub rtts: Vec<i64>,
    #[serde(default)]
    pub min_rtt: i64,
    #[serde(default)]
    pub max_rtt: i64,
    #[serde(default)]
    pub avg_rtt: i64,
    #[serde(default)]
    pub std_dev_rtt: i64,
}

/// Executor output for a successful instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPayload {
    Command(String),
    BrowserInspect(PageInspection),
    Dns(Vec<String>),
    Http(HttpInspection),
    Icmp(IcmpStatistics),
}

impl ReplyPayload {
    pub fn kind(&self) -> InstructionType {
        match self {
            ReplyPayload::Command(_) => InstructionType::Command,
            ReplyPayload::BrowserInspect(_) => InstructionType::BrowserInspect,
            ReplyPayload::Dns(_) => InstructionType::Dns,
            ReplyPayload::Http(_) => InstructionType::Http,
            ReplyPayload::Icmp(_) => InstructionType::Icmp,
        }
    }

    /// Empty reply of the given kind, used when a peer reports success but
    /// leaves the reply field out.
    pub fn empty(kind: InstructionType) -> Self {
        match kind {
            InstructionType::Command => ReplyPayload::Command(String::new()),
            InstructionType::BrowserInspect => ReplyPayload::BrowserInspect(Default::default()),
            InstructionType::Dns => ReplyPayload::Dns(Vec::new()),
            InstructionType::Http => ReplyPayload::Http(Default::default()),
            InstructionType::Icmp => ReplyPayload::Icmp(Default::default()),
        }
    }

    /// Text stored in the ledger's `reply` column.
    ///
    /// Command output is stored verbatim and DNS answers comma-joined; the
    /// structured replies are stored as JSON.
    pub fn ledger_text(&self) -> String {
        match self {
            ReplyPayload::Command(stdout) => stdout.clone(),
            ReplyPayload::Dns(addrs) => addrs.join(","),
            ReplyPayload::BrowserInspect(page) => to_json(page),
            ReplyPayload::Http(http) => to_json(http),
            ReplyPayload::Icmp(stats) => to_json(stats),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Success(ReplyPayload),
    Failure(String),
}

/// The soldier's answer to one [`crate::InstructionRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionReply {
    pub uuid: String,
    pub kind: InstructionType,
    pub outcome: ReplyOutcome,
}

impl InstructionReply {
    pub fn success(uuid: impl Into<String>, payload: ReplyPayload) -> Self {
        Self {
            uuid: uuid.into(),
            kind: payload.kind(),
            outcome: ReplyOutcome::Success(payload),
        }
    }

    pub fn failure(uuid: impl Into<String>, kind: InstructionType, err: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            kind,
            outcome: ReplyOutcome::Failure(err.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ReplyOutcome::Success(_))
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_zero_u16(value: &u16) -> bool {
    *value == 0
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
