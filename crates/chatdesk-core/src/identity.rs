use serde::{Deserialize, Serialize};

use crate::chat::MessageKind;
use crate::ids::AccountId;

pub const GUEST_DISPLAY_NAME: &str = "Guest";

/// Role a connection acts under for one inbound event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    GuestAuthenticated,
    Agent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guest => write!(f, "guest"),
            Self::GuestAuthenticated => write!(f, "guest_authenticated"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// Result of resolving a (possibly absent) bearer credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub role: Role,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
}

impl Identity {
    pub fn guest() -> Self {
        Self {
            role: Role::Guest,
            display_name: GUEST_DISPLAY_NAME.to_string(),
            account_id: None,
        }
    }

    pub fn agent(account_id: AccountId, display_name: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            display_name: display_name.into(),
            account_id: Some(account_id),
        }
    }

    pub fn authenticated_guest(account_id: AccountId, display_name: impl Into<String>) -> Self {
        Self {
            role: Role::GuestAuthenticated,
            display_name: display_name.into(),
            account_id: Some(account_id),
        }
    }

    pub fn is_agent(&self) -> bool {
        self.role == Role::Agent
    }

    /// Message kind this identity writes as.
    pub fn message_kind(&self) -> MessageKind {
        if self.is_agent() {
            MessageKind::Agent
        } else {
            MessageKind::Visitor
        }
    }
}

/// Why a presented credential was not honoured. Logged, never surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialFailure {
    SignatureInvalid,
    Expired,
    SubjectNotFound,
    Malformed,
}

impl CredentialFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "signature_invalid",
            Self::Expired => "expired",
            Self::SubjectNotFound => "subject_not_found",
            Self::Malformed => "malformed",
        }
    }
}

impl std::fmt::Display for CredentialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}
