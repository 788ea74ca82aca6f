//! Publication lifecycle: `draft → approved → scheduled → sent`, plus `failed`.
//!
//! Every status change is a conditional write in the store keyed on the
//! statuses a [`Transition`] accepts; anything else is rejected unchanged.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::Publication;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicationStatus {
    Draft,
    Approved,
    Scheduled,
    Sent,
    Failed,
}

impl PublicationStatus {
    pub const ALL: [PublicationStatus; 5] = [
        Self::Draft,
        Self::Approved,
        Self::Scheduled,
        Self::Sent,
        Self::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Scheduled => "scheduled",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent)
    }

    /// Whether any transition moves `self` to `to`.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        Transition::ALL
            .iter()
            .any(|transition| transition.target() == to && transition.accepts(self))
    }
}

impl fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicationStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| anyhow::anyhow!("unknown publication status: {value}"))
    }
}

/// A named edge of the lifecycle and who may take it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Approval endpoint. Re-approval refreshes approver and time.
    Approve,
    /// Publication dispatch, only inside the trailing window.
    Claim,
    /// Undo of a claim whose `publication.schedule` could not be published.
    Release,
    /// Delivery consumer after the channel accepted the post.
    MarkSent,
    /// Delivery consumer on its final attempt.
    MarkFailed,
}

impl Transition {
    pub const ALL: [Transition; 5] = [
        Self::Approve,
        Self::Claim,
        Self::Release,
        Self::MarkSent,
        Self::MarkFailed,
    ];

    #[must_use]
    pub fn sources(self) -> &'static [PublicationStatus] {
        use PublicationStatus::{Approved, Draft, Failed, Scheduled};
        match self {
            Self::Approve => &[Draft, Approved, Failed],
            Self::Claim => &[Approved],
            Self::Release | Self::MarkSent | Self::MarkFailed => &[Scheduled],
        }
    }

    #[must_use]
    pub fn target(self) -> PublicationStatus {
        match self {
            Self::Approve | Self::Release => PublicationStatus::Approved,
            Self::Claim => PublicationStatus::Scheduled,
            Self::MarkSent => PublicationStatus::Sent,
            Self::MarkFailed => PublicationStatus::Failed,
        }
    }

    #[must_use]
    pub fn accepts(self, current: PublicationStatus) -> bool {
        self.sources().contains(&current)
    }

    /// Source statuses as SQL text values.
    #[must_use]
    pub fn source_names(self) -> Vec<String> {
        self.sources()
            .iter()
            .map(|status| status.as_str().to_string())
            .collect()
    }
}

/// Result of a conditional status write.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Publication),
    Rejected { current: PublicationStatus },
    NotFound,
}

impl TransitionOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Rejected { .. } => "rejected",
            Self::NotFound => "not_found",
        }
    }
}
