//! JSON shapes exchanged on the websocket.
//!
//! These structs mirror the frames deployed peers emit, field for field. The
//! typed API in the crate root converts to and from them; application code
//! should not need to touch them directly.

use serde::{Deserialize, Serialize};

use crate::reply::{HttpInspection, IcmpStatistics, PageInspection};

pub const DIRECTIVE_HELLO_ECHO: i32 = 1;
pub const DIRECTIVE_INSTRUCT: i32 = 2;

pub const REPORT_HELLO_ECHO: i32 = 1;
pub const REPORT_INSTRUCT_REPLY: i32 = 2;
pub const REPORT_SCREEN_CAPTURE: i32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireInstruction {
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "type", default)]
    pub kind: i32,
    #[serde(rename = "commandContent", default, skip_serializing_if = "String::is_empty")]
    pub command_content: String,
    #[serde(rename = "commandReply", default, skip_serializing_if = "String::is_empty")]
    pub command_reply: String,
    #[serde(rename = "chromeDpInspectUrl", default, skip_serializing_if = "String::is_empty")]
    pub browser_url: String,
    #[serde(rename = "chromeDpInspectReply", default, skip_serializing_if = "Option::is_none")]
    pub browser_reply: Option<PageInspection>,
    #[serde(rename = "dnsContent", default, skip_serializing_if = "String::is_empty")]
    pub dns_content: String,
    #[serde(rename = "dnsInspectReply", default, skip_serializing_if = "Option::is_none")]
    pub dns_reply: Option<Vec<String>>,
    #[serde(rename = "httpInspectUrl", default, skip_serializing_if = "String::is_empty")]
    pub http_url: String,
    #[serde(rename = "httpInspectReply", default, skip_serializing_if = "Option::is_none")]
    pub http_reply: Option<HttpInspection>,
    #[serde(rename = "icmpInspectAddr", default, skip_serializing_if = "String::is_empty")]
    pub icmp_addr: String,
    #[serde(rename = "IcmpInspectReply", default, skip_serializing_if = "Option::is_none")]
    pub icmp_reply: Option<IcmpStatistics>,
    #[serde(default)]
    pub result: bool,
    #[serde(rename = "errMsg", default, skip_serializing_if = "String::is_empty")]
    pub err_msg: String,
}

/// Commander to soldier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireDirective {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "instructMessage", default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<WireInstruction>,
}

/// Soldier to commander.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireReport {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "instructMessage", default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<WireInstruction>,
    #[serde(
        rename = "chromeDpScreenShot",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub screenshot: Vec<u8>,
}

/// Byte buffers travel as standard base64 strings; `null` reads as empty.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
