//! Protocol and record types shared by the camp commander and its soldiers.
//!
//! The commander sends [`Directive`] envelopes down a websocket; soldiers answer
//! with [`Report`] envelopes. Both are encoded as JSON with the field names used
//! by already deployed peers, see [`wire`].

mod envelope;
mod identity;
mod instruction;
mod record;
mod reply;
pub mod wire;

pub use envelope::{
    decode_directive, decode_report, encode_directive, encode_report, DecodeError, Directive,
    DirectiveKind, Payload, Report, ReportKind, UnknownInstruction,
};
pub use identity::{AgentIdentity, IdentityError};
pub use instruction::{InstructionRequest, InstructionType, UnknownInstructionType};
pub use record::{Instance, InstructionRecord, InstructionState};
pub use reply::{
    HttpInspection, IcmpStatistics, InstructionReply, IpAddress, PageInspection, ReplyOutcome,
    ReplyPayload, ResourceInspection,
};
