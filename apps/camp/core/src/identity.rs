use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The `(org, group, instance)` triple naming one soldier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    #[serde(rename = "orgUuid", alias = "orgId")]
    pub org_id: String,
    #[serde(rename = "groupUuid", alias = "groupId")]
    pub group_id: String,
    #[serde(rename = "instanceName")]
    pub instance_name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("{0} must not be empty")]
    Missing(&'static str),
}

impl AgentIdentity {
    pub fn new(
        org_id: impl Into<String>,
        group_id: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            org_id: org_id.into().trim().to_string(),
            group_id: group_id.into().trim().to_string(),
            instance_name: instance_name.into().trim().to_string(),
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.org_id.is_empty() {
            return Err(IdentityError::Missing("orgUuid"));
        }
        if self.group_id.is_empty() {
            return Err(IdentityError::Missing("groupUuid"));
        }
        if self.instance_name.is_empty() {
            return Err(IdentityError::Missing("instanceName"));
        }
        Ok(())
    }

    /// Colon-joined form used for storage keys. Each field is escaped so
    /// distinct identities never share a key.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            escape_key_part(&self.org_id),
            escape_key_part(&self.group_id),
            escape_key_part(&self.instance_name)
        )
    }
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for ch in part.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    escaped
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org_id, self.group_id, self.instance_name)
    }
}
