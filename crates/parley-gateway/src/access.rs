use parley_core::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted review status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Status {
    Unreviewed,
    Whitelisted,
    Blacklisted,
    Privileged,
}

impl Status {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Status::Unreviewed => "unreviewed",
            Status::Whitelisted => "whitelisted",
            Status::Blacklisted => "blacklisted",
            Status::Privileged => "admin",
        }
    }

    /// Status given to a user seen for the first time.
    pub(crate) fn initial(user: UserId, admin: UserId) -> Self {
        if user == admin {
            Status::Privileged
        } else {
            Status::Unreviewed
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate verdict for an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    NotFound,
    Unreviewed,
    Blacklisted,
    Whitelisted,
    Privileged,
}

impl Access {
    /// Whether the event may proceed to command handling.
    pub(crate) fn admits(self) -> bool {
        matches!(self, Access::Whitelisted | Access::Privileged)
    }
}

pub(crate) fn classify(status: Option<Status>) -> Access {
    match status {
        None => Access::NotFound,
        Some(Status::Unreviewed) => Access::Unreviewed,
        Some(Status::Blacklisted) => Access::Blacklisted,
        Some(Status::Whitelisted) => Access::Whitelisted,
        Some(Status::Privileged) => Access::Privileged,
    }
}

/// Approval command issued by the privileged user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Approval {
    Whitelist,
    Blacklist,
}

impl Approval {
    pub(crate) fn target(self) -> Status {
        match self {
            Approval::Whitelist => Status::Whitelisted,
            Approval::Blacklist => Status::Blacklisted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusChange {
    Changed,
    Already,
}

/// Apply a status transition. Re-applying the current status is a no-op.
pub(crate) fn change_status(current: &mut Status, target: Status) -> StatusChange {
    if *current == target {
        return StatusChange::Already;
    }
    *current = target;
    StatusChange::Changed
}
