use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};

// --- Enums ---

/// Ticket lifecycle status as read from the store.
///
/// `done` and `complete` parse to `Completed`; both are terminal success.
/// Anything unrecognized is kept verbatim in `Unknown` and is never eligible.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum TicketStatus {
    #[default]
    Todo,
    InProgress,
    InReview,
    Completed,
    Blocked,
    Cancelled,
    Unknown(String),
}

impl TicketStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TicketStatus::Todo => "todo",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::InReview => "in_review",
            TicketStatus::Completed => "completed",
            TicketStatus::Blocked => "blocked",
            TicketStatus::Cancelled => "cancelled",
            TicketStatus::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TicketStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Parse a status cell. Case, surrounding whitespace, spaces and dashes are normalized.
pub fn parse_status(s: &str) -> TicketStatus {
    let normalized = normalize_token(s);
    match normalized.as_str() {
        "todo" | "to_do" | "open" => TicketStatus::Todo,
        "in_progress" | "doing" => TicketStatus::InProgress,
        "in_review" | "review" => TicketStatus::InReview,
        "completed" | "complete" | "done" => TicketStatus::Completed,
        "blocked" => TicketStatus::Blocked,
        "cancelled" | "canceled" => TicketStatus::Cancelled,
        _ => TicketStatus::Unknown(s.trim().to_string()),
    }
}

/// Agent role expected to act on a ticket.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Swe,
    Qa,
    Pm,
    Docs,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Swe => "swe",
            Role::Qa => "qa",
            Role::Pm => "pm",
            Role::Docs => "docs",
        }
    }

    /// Guess a role from free-text assignee wording, e.g. "QA team" or "docs writer".
    ///
    /// Matching is per alphanumeric token so that words like "development"
    /// never match the `pm` keyword by substring.
    pub fn infer_from_assignee(text: &str) -> Option<Role> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_ascii_lowercase())
            .collect();

        let any = |pred: &dyn Fn(&str) -> bool| tokens.iter().any(|t| pred(t));

        if any(&|t| t == "qa" || t.starts_with("test") || t == "quality") {
            Some(Role::Qa)
        } else if any(&|t| t == "pm" || t == "product" || t == "manager") {
            Some(Role::Pm)
        } else if any(&|t| t.starts_with("doc") || t == "writer") {
            Some(Role::Docs)
        } else if any(&|t| t == "swe" || t.starts_with("engineer") || t.starts_with("dev")) {
            Some(Role::Swe)
        } else {
            None
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_role(s: &str) -> Result<Role, String> {
    match normalize_token(s).as_str() {
        "swe" | "engineer" | "dev" => Ok(Role::Swe),
        "qa" => Ok(Role::Qa),
        "pm" => Ok(Role::Pm),
        "docs" | "doc" => Ok(Role::Docs),
        _ => Err(format!(
            "Invalid role '{}': expected swe, qa, pm, or docs",
            s.trim()
        )),
    }
}

/// Lowercase, trim, and map spaces/dashes to underscores.
pub(crate) fn normalize_token(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

// --- Structs ---

#[derive(Serialize, Clone, Debug, PartialEq, Default)]
pub struct Ticket {
    pub id: String,
    pub status: TicketStatus,
    pub title: String,
    /// Raw explicit role cell; empty when the store has no role for this ticket.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub assignee: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Columns the dispatcher does not interpret, preserved as read.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Ticket {
    pub fn new(id: &str, status: TicketStatus) -> Self {
        Self {
            id: id.to_string(),
            status,
            ..Default::default()
        }
    }

    /// The role that authors work on this ticket.
    ///
    /// Explicit role wins; an explicit value that doesn't parse yields `None`
    /// rather than a guess. Otherwise the assignee is consulted, then `swe`.
    pub fn work_role(&self) -> Option<Role> {
        if !self.role.trim().is_empty() {
            return parse_role(&self.role).ok();
        }
        Some(Role::infer_from_assignee(&self.assignee).unwrap_or(Role::Swe))
    }

    /// The role this ticket is eligible for in its current status, ignoring dependencies.
    ///
    /// `todo` tickets go to their work role; `in_review` always goes to QA.
    pub fn eligible_role(&self) -> Option<Role> {
        match self.status {
            TicketStatus::Todo => self.work_role(),
            TicketStatus::InReview => Some(Role::Qa),
            _ => None,
        }
    }
}

/// Identity of a unit of dispatch: one role working one ticket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub role: Role,
    pub ticket_id: String,
}

impl SessionKey {
    pub fn new(role: Role, ticket_id: &str) -> Self {
        Self {
            role,
            ticket_id: ticket_id.to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.ticket_id)
    }
}

/// A ticket snapshot waiting in the dispatch queue for a role.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    pub ticket: Ticket,
    pub role: Role,
}

impl QueueEntry {
    pub fn new(ticket: Ticket, role: Role) -> Self {
        Self { ticket, role }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.role, &self.ticket.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_accepts_aliases() {
        assert_eq!(parse_status("todo"), TicketStatus::Todo);
        assert_eq!(parse_status(" To Do "), TicketStatus::Todo);
        assert_eq!(parse_status("in-review"), TicketStatus::InReview);
        assert_eq!(parse_status("In Progress"), TicketStatus::InProgress);
        assert_eq!(parse_status("done"), TicketStatus::Completed);
        assert_eq!(parse_status("COMPLETED"), TicketStatus::Completed);
        assert_eq!(parse_status("canceled"), TicketStatus::Cancelled);
        assert_eq!(
            parse_status("parked"),
            TicketStatus::Unknown("parked".to_string())
        );
    }

    #[test]
    fn infer_role_matches_whole_tokens() {
        assert_eq!(Role::infer_from_assignee("QA team"), Some(Role::Qa));
        assert_eq!(Role::infer_from_assignee("tester-bot"), Some(Role::Qa));
        assert_eq!(Role::infer_from_assignee("Product owner"), Some(Role::Pm));
        assert_eq!(Role::infer_from_assignee("docs writer"), Some(Role::Docs));
        assert_eq!(Role::infer_from_assignee("backend engineer"), Some(Role::Swe));
        // "development" must not hit the pm keyword
        assert_eq!(Role::infer_from_assignee("development"), Some(Role::Swe));
        assert_eq!(Role::infer_from_assignee("alice"), None);
    }

    #[test]
    fn work_role_prefers_explicit_role() {
        let mut ticket = Ticket::new("T-1", TicketStatus::Todo);
        ticket.role = "docs".to_string();
        ticket.assignee = "qa".to_string();
        assert_eq!(ticket.work_role(), Some(Role::Docs));
    }

    #[test]
    fn work_role_rejects_unknown_explicit_role() {
        let mut ticket = Ticket::new("T-1", TicketStatus::Todo);
        ticket.role = "designer".to_string();
        assert_eq!(ticket.work_role(), None);
    }

    #[test]
    fn work_role_defaults_to_swe() {
        let ticket = Ticket::new("T-1", TicketStatus::Todo);
        assert_eq!(ticket.work_role(), Some(Role::Swe));
    }

    #[test]
    fn in_review_is_always_qa() {
        let mut ticket = Ticket::new("T-1", TicketStatus::InReview);
        ticket.role = "pm".to_string();
        assert_eq!(ticket.eligible_role(), Some(Role::Qa));
    }

    #[test]
    fn non_trigger_statuses_are_not_eligible() {
        for status in [
            TicketStatus::InProgress,
            TicketStatus::Completed,
            TicketStatus::Blocked,
            TicketStatus::Cancelled,
        ] {
            assert_eq!(Ticket::new("T-1", status).eligible_role(), None);
        }
    }

    #[test]
    fn session_key_display() {
        assert_eq!(SessionKey::new(Role::Qa, "T-5").to_string(), "qa:T-5");
    }
}
