use thiserror::Error;

use crate::instruction::{InstructionRequest, InstructionType};
use crate::reply::{InstructionReply, ReplyOutcome, ReplyPayload};
use crate::wire::{
    WireDirective, WireInstruction, WireReport, DIRECTIVE_HELLO_ECHO, DIRECTIVE_INSTRUCT,
    REPORT_HELLO_ECHO, REPORT_INSTRUCT_REPLY, REPORT_SCREEN_CAPTURE,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message type {0} requires an instructMessage")]
    MissingInstruction(i32),
}

/// An instruction whose `type` tag this build does not recognise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownInstruction {
    pub uuid: String,
    pub code: i32,
}

/// Instruction payload after tag dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    Known(T),
    Unknown(UnknownInstruction),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveKind {
    HelloEcho,
    Instruct(Payload<InstructionRequest>),
    Unknown(i32),
}

/// Commander to soldier envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub text: String,
    pub kind: DirectiveKind,
}

impl Directive {
    pub fn hello(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: DirectiveKind::HelloEcho,
        }
    }

    pub fn instruct(request: InstructionRequest) -> Self {
        Self {
            text: String::new(),
            kind: DirectiveKind::Instruct(Payload::Known(request)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportKind {
    HelloEcho,
    InstructReply(Payload<InstructionReply>),
    ScreenCapture(Vec<u8>),
    Unknown(i32),
}

/// Soldier to commander envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub text: String,
    pub kind: ReportKind,
}

impl Report {
    pub fn hello(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: ReportKind::HelloEcho,
        }
    }

    pub fn reply(reply: InstructionReply) -> Self {
        Self {
            text: String::new(),
            kind: ReportKind::InstructReply(Payload::Known(reply)),
        }
    }
}

pub fn encode_directive(directive: &Directive) -> Vec<u8> {
    let wire = match &directive.kind {
        DirectiveKind::HelloEcho => WireDirective {
            kind: DIRECTIVE_HELLO_ECHO,
            message: directive.text.clone(),
            instruction: None,
        },
        DirectiveKind::Instruct(payload) => WireDirective {
            kind: DIRECTIVE_INSTRUCT,
            message: directive.text.clone(),
            instruction: Some(match payload {
                Payload::Known(request) => request_to_wire(request),
                Payload::Unknown(unknown) => unknown_to_wire(unknown),
            }),
        },
        DirectiveKind::Unknown(code) => WireDirective {
            kind: *code,
            message: directive.text.clone(),
            instruction: None,
        },
    };
    to_vec(&wire)
}

pub fn decode_directive(bytes: &[u8]) -> Result<Directive, DecodeError> {
    let wire: WireDirective = serde_json::from_slice(bytes)?;
    let kind = match wire.kind {
        DIRECTIVE_HELLO_ECHO => DirectiveKind::HelloEcho,
        DIRECTIVE_INSTRUCT => {
            let instruction = wire
                .instruction
                .ok_or(DecodeError::MissingInstruction(wire.kind))?;
            DirectiveKind::Instruct(request_from_wire(instruction))
        }
        other => DirectiveKind::Unknown(other),
    };
    Ok(Directive {
        text: wire.message,
        kind,
    })
}

pub fn encode_report(report: &Report) -> Vec<u8> {
    let mut wire = WireReport {
        message: report.text.clone(),
        ..Default::default()
    };
    match &report.kind {
        ReportKind::HelloEcho => wire.kind = REPORT_HELLO_ECHO,
        ReportKind::InstructReply(payload) => {
            wire.kind = REPORT_INSTRUCT_REPLY;
            wire.instruction = Some(match payload {
                Payload::Known(reply) => reply_to_wire(reply),
                Payload::Unknown(unknown) => unknown_to_wire(unknown),
            });
        }
        ReportKind::ScreenCapture(image) => {
            wire.kind = REPORT_SCREEN_CAPTURE;
            wire.screenshot = image.clone();
        }
        ReportKind::Unknown(code) => wire.kind = *code,
    }
    to_vec(&wire)
}

pub fn decode_report(bytes: &[u8]) -> Result<Report, DecodeError> {
    let wire: WireReport = serde_json::from_slice(bytes)?;
    let kind = match wire.kind {
        REPORT_HELLO_ECHO => ReportKind::HelloEcho,
        REPORT_INSTRUCT_REPLY => {
            let instruction = wire
                .instruction
                .ok_or(DecodeError::MissingInstruction(wire.kind))?;
            ReportKind::InstructReply(reply_from_wire(instruction))
        }
        REPORT_SCREEN_CAPTURE => ReportKind::ScreenCapture(wire.screenshot),
        other => ReportKind::Unknown(other),
    };
    Ok(Report {
        text: wire.message,
        kind,
    })
}

fn to_vec<T: serde::Serialize>(wire: &T) -> Vec<u8> {
    // Wire structs hold only strings, numbers and JSON values.
    serde_json::to_vec(wire).unwrap_or_default()
}

fn unknown_to_wire(unknown: &UnknownInstruction) -> WireInstruction {
    WireInstruction {
        uuid: unknown.uuid.clone(),
        kind: unknown.code,
        ..Default::default()
    }
}

fn request_to_wire(request: &InstructionRequest) -> WireInstruction {
    let mut wire = WireInstruction {
        uuid: request.uuid.clone(),
        kind: request.kind.code(),
        ..Default::default()
    };
    let content = request.content.clone();
    match request.kind {
        InstructionType::Command => wire.command_content = content,
        InstructionType::BrowserInspect => wire.browser_url = content,
        InstructionType::Dns => wire.dns_content = content,
        InstructionType::Http => wire.http_url = content,
        InstructionType::Icmp => wire.icmp_addr = content,
    }
    wire
}

fn request_from_wire(wire: WireInstruction) -> Payload<InstructionRequest> {
    let Ok(kind) = InstructionType::try_from(wire.kind) else {
        return Payload::Unknown(UnknownInstruction {
            uuid: wire.uuid,
            code: wire.kind,
        });
    };
    let content = match kind {
        InstructionType::Command => wire.command_content,
        InstructionType::BrowserInspect => wire.browser_url,
        InstructionType::Dns => wire.dns_content,
        InstructionType::Http => wire.http_url,
        InstructionType::Icmp => wire.icmp_addr,
    };
    Payload::Known(InstructionRequest {
        uuid: wire.uuid,
        kind,
        content,
    })
}

fn reply_to_wire(reply: &InstructionReply) -> WireInstruction {
    let mut wire = WireInstruction {
        uuid: reply.uuid.clone(),
        kind: reply.kind.code(),
        ..Default::default()
    };
    match &reply.outcome {
        ReplyOutcome::Success(payload) => {
            wire.result = true;
            match payload.clone() {
                ReplyPayload::Command(stdout) => wire.command_reply = stdout,
                ReplyPayload::BrowserInspect(page) => wire.browser_reply = Some(page),
                ReplyPayload::Dns(addrs) => wire.dns_reply = Some(addrs),
                ReplyPayload::Http(http) => wire.http_reply = Some(http),
                ReplyPayload::Icmp(stats) => wire.icmp_reply = Some(stats),
            }
        }
        ReplyOutcome::Failure(err) => {
            wire.result = false;
            wire.err_msg = err.clone();
        }
    }
    wire
}

fn reply_from_wire(wire: WireInstruction) -> Payload<InstructionReply> {
    let Ok(kind) = InstructionType::try_from(wire.kind) else {
        return Payload::Unknown(UnknownInstruction {
            uuid: wire.uuid,
            code: wire.kind,
        });
    };
    if !wire.result {
        return Payload::Known(InstructionReply::failure(wire.uuid, kind, wire.err_msg));
    }
    let payload = match kind {
        InstructionType::Command => Some(ReplyPayload::Command(wire.command_reply)),
        InstructionType::BrowserInspect => wire.browser_reply.map(ReplyPayload::BrowserInspect),
        InstructionType::Dns => wire.dns_reply.map(ReplyPayload::Dns),
        InstructionType::Http => wire.http_reply.map(ReplyPayload::Http),
        InstructionType::Icmp => wire.icmp_reply.map(ReplyPayload::Icmp),
    }
    .unwrap_or_else(|| ReplyPayload::empty(kind));
    Payload::Known(InstructionReply::success(wire.uuid, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::HttpInspection;

    #[test_timeout::timeout]
    fn decodes_instruct_directive_from_deployed_peer() {
        let frame = br#"{"type":2,"message":"","instructMessage":{"uuid":"abc","type":3,"dnsContent":"example.com","result":false}}"#;
        let directive = decode_directive(frame).unwrap();
        assert_eq!(
            directive.kind,
            DirectiveKind::Instruct(Payload::Known(InstructionRequest {
                uuid: "abc".into(),
                kind: InstructionType::Dns,
                content: "example.com".into(),
            }))
        );
    }

    #[test_timeout::timeout]
    fn unknown_message_type_is_not_an_error() {
        let directive = decode_directive(br#"{"type":42,"message":"future"}"#).unwrap();
        assert_eq!(directive.kind, DirectiveKind::Unknown(42));
        assert_eq!(directive.text, "future");

        let report = decode_report(br#"{"type":9}"#).unwrap();
        assert_eq!(report.kind, ReportKind::Unknown(9));
    }

    #[test_timeout::timeout]
    fn unknown_instruction_type_routes_to_unknown_branch() {
        let report = decode_report(
            br#"{"type":2,"instructMessage":{"uuid":"u1","type":77,"result":true}}"#,
        )
        .unwrap();
        assert_eq!(
            report.kind,
            ReportKind::InstructReply(Payload::Unknown(UnknownInstruction {
                uuid: "u1".into(),
                code: 77,
            }))
        );
    }

    #[test_timeout::timeout]
    fn malformed_bytes_fail_to_decode() {
        assert!(matches!(
            decode_report(b"\x00\x01not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_directive(br#"{"type":2}"#),
            Err(DecodeError::MissingInstruction(2))
        ));
    }

    #[test_timeout::timeout]
    fn reply_fields_follow_the_instruction_type() {
        let reply = InstructionReply::success(
            "u2",
            ReplyPayload::Http(HttpInspection {
                url: "http://a.test".into(),
                status_code: 204,
                response: Vec::new(),
            }),
        );
        let bytes = encode_report(&Report::reply(reply.clone()));
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], 2);
        assert_eq!(json["instructMessage"]["type"], 4);
        assert_eq!(json["instructMessage"]["result"], true);
        assert_eq!(json["instructMessage"]["httpInspectReply"]["statusCode"], 204);
        assert!(json["instructMessage"].get("errMsg").is_none());

        let decoded = decode_report(&bytes).unwrap();
        assert_eq!(decoded.kind, ReportKind::InstructReply(Payload::Known(reply)));
    }

    #[test_timeout::timeout]
    fn failure_reply_carries_error_and_no_reply_fields() {
        let reply = InstructionReply::failure("u3", InstructionType::Command, "exit status: 1");
        let bytes = encode_report(&Report::reply(reply));
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["instructMessage"]["result"], false);
        assert_eq!(json["instructMessage"]["errMsg"], "exit status: 1");
        assert!(json["instructMessage"].get("commandReply").is_none());
    }

    #[test_timeout::timeout]
    fn success_without_reply_field_yields_empty_payload() {
        let report =
            decode_report(br#"{"type":2,"instructMessage":{"uuid":"u4","type":3,"result":true,"dnsInspectReply":null}}"#)
                .unwrap();
        let ReportKind::InstructReply(Payload::Known(reply)) = report.kind else {
            panic!("expected a known reply");
        };
        assert_eq!(reply.outcome, ReplyOutcome::Success(ReplyPayload::Dns(Vec::new())));
    }

    #[test_timeout::timeout]
    fn screen_capture_is_base64_on_the_wire() {
        let bytes = encode_report(&Report {
            text: String::new(),
            kind: ReportKind::ScreenCapture(vec![0x89, 0x50, 0x4e, 0x47]),
        });
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["chromeDpScreenShot"], "iVBORw==");
        let report = decode_report(&bytes).unwrap();
        assert_eq!(report.kind, ReportKind::ScreenCapture(vec![0x89, 0x50, 0x4e, 0x47]));
    }
}
