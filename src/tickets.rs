use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use crate::types::{normalize_token, parse_status, Ticket, TicketStatus};
use crate::{log_debug, log_warn};

// --- CSV tokenizing ---

/// Split raw CSV text into records of fields.
///
/// Quoted fields may contain the delimiter, newlines, and quotes escaped
/// either as `""` or `\"`. A `\"` right before a delimiter, line break or end
/// of input is a literal backslash followed by the closing quote, so Windows
/// paths like `"C:\dir\"` end their field. Carriage returns outside quotes
/// are dropped so CRLF files read like LF files. Records with no content are
/// skipped. An unterminated quote at end of input keeps whatever was read.
pub fn split_records(raw: &str) -> Vec<Vec<String>> {
    let text = raw.strip_prefix('\u{feff}').unwrap_or(raw);

    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '\\' if chars.peek() == Some(&'"') && !quote_ends_field(&chars) => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }

    records
}

/// Whether the quote at the head of `chars` is followed by a field boundary.
fn quote_ends_field(chars: &Peekable<Chars<'_>>) -> bool {
    let mut ahead = chars.clone();
    ahead.next();
    matches!(ahead.peek(), None | Some(',') | Some('\n') | Some('\r'))
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    if record.iter().all(|f| f.trim().is_empty()) {
        return;
    }
    records.push(record);
}

// --- Header mapping ---

#[derive(Default)]
struct Columns {
    id: Option<usize>,
    status: Option<usize>,
    title: Option<usize>,
    role: Option<usize>,
    assignee: Option<usize>,
    dependencies: Option<usize>,
    extra: Vec<(usize, String)>,
}

impl Columns {
    fn from_header(header: &[String]) -> Self {
        let mut columns = Columns::default();
        for (idx, name) in header.iter().enumerate() {
            let slot = match normalize_token(name).as_str() {
                "id" | "ticket_id" | "ticket" => &mut columns.id,
                "status" | "state" => &mut columns.status,
                "title" | "name" | "summary" => &mut columns.title,
                "role" | "agent" | "agent_type" => &mut columns.role,
                "assignee" | "assigned_to" | "owner" => &mut columns.assignee,
                "dependencies" | "depends_on" | "deps" | "dependency" => &mut columns.dependencies,
                _ => {
                    columns.extra.push((idx, name.trim().to_string()));
                    continue;
                }
            };
            // First matching column wins; later aliases become metadata
            if slot.is_none() {
                *slot = Some(idx);
            } else {
                columns.extra.push((idx, name.trim().to_string()));
            }
        }
        columns
    }
}

fn cell(row: &[String], idx: Option<usize>) -> String {
    idx.and_then(|i| row.get(i))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

// --- Parsing ---

/// Parse the ticket store contents.
///
/// Never fails: a file without a recognizable header yields an empty list,
/// bad rows are skipped, and missing trailing fields read as empty.
pub fn parse(raw: &str) -> Vec<Ticket> {
    let mut records = split_records(raw).into_iter();

    let Some(header) = records.next() else {
        return Vec::new();
    };

    let columns = Columns::from_header(&header);
    let (Some(id_col), Some(_)) = (columns.id, columns.status) else {
        log_warn!("[store] Ticket store header has no id/status column, ignoring contents");
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut tickets = Vec::new();

    for (line, row) in records.enumerate() {
        let id = cell(&row, Some(id_col));
        if id.is_empty() {
            log_debug!("[store] Skipping row {} with empty id", line + 2);
            continue;
        }
        if !seen.insert(id.clone()) {
            log_warn!("[store] Duplicate ticket id {} on row {}, skipping", id, line + 2);
            continue;
        }

        let metadata: BTreeMap<String, String> = columns
            .extra
            .iter()
            .filter(|(_, name)| !name.is_empty())
            .map(|(idx, name)| (name.clone(), cell(&row, Some(*idx))))
            .collect();

        tickets.push(Ticket {
            id,
            status: parse_status(&cell(&row, columns.status)),
            title: cell(&row, columns.title),
            role: cell(&row, columns.role),
            assignee: cell(&row, columns.assignee),
            dependencies: parse_dependencies(&cell(&row, columns.dependencies)),
            metadata,
        });
    }

    tickets
}

/// Split dependency text on commas, then on whitespace inside each part.
pub fn parse_dependencies(text: &str) -> Vec<String> {
    text.split(',')
        .flat_map(str::split_whitespace)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// --- Dependency satisfaction ---

/// A dependency that keeps a ticket from being eligible.
#[derive(Debug, Clone, PartialEq)]
pub struct UnmetDependency {
    pub id: String,
    /// Current status of the dependency, or `None` when no ticket has that id.
    pub status: Option<TicketStatus>,
}

impl fmt::Display for UnmetDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            Some(status) => write!(f, "{} ({})", self.id, status),
            None => write!(f, "{} (missing)", self.id),
        }
    }
}

/// True iff every dependency resolves to a ticket whose status is exactly completed.
pub fn dependencies_satisfied(ticket: &Ticket, all: &[Ticket]) -> bool {
    if ticket.dependencies.is_empty() {
        return true;
    }
    let index = status_index(all);
    satisfied_in(ticket, &index)
}

pub(crate) fn status_index(all: &[Ticket]) -> HashMap<&str, &TicketStatus> {
    all.iter().map(|t| (t.id.as_str(), &t.status)).collect()
}

pub(crate) fn satisfied_in(ticket: &Ticket, index: &HashMap<&str, &TicketStatus>) -> bool {
    ticket
        .dependencies
        .iter()
        .all(|dep| matches!(index.get(dep.as_str()), Some(TicketStatus::Completed)))
}

pub fn unmet_dependencies(ticket: &Ticket, all: &[Ticket]) -> Vec<UnmetDependency> {
    let index = status_index(all);
    ticket
        .dependencies
        .iter()
        .filter_map(|dep| match index.get(dep.as_str()) {
            Some(TicketStatus::Completed) => None,
            Some(status) => Some(UnmetDependency {
                id: dep.clone(),
                status: Some((*status).clone()),
            }),
            None => Some(UnmetDependency {
                id: dep.clone(),
                status: None,
            }),
        })
        .collect()
}

/// One-line summary such as `T-1 (todo), T-9 (missing)`, or `None` when all are met.
pub fn unmet_dep_summary(ticket: &Ticket, all: &[Ticket]) -> Option<String> {
    let unmet = unmet_dependencies(ticket, all);
    if unmet.is_empty() {
        return None;
    }
    Some(
        unmet
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    )
}
