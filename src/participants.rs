use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::Utf8Path;

use crate::domain::Label;
use crate::error::{ParticipantError, ResolutionError};

const SUBJECT_COLUMNS: &[&str] = &["eid", "participant_id"];
const INSTANCE_COLUMNS: &[&str] = &["instance"];
const SESSION_COLUMNS: &[&str] = &["session", "session_id"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantTable {
    subjects: BTreeMap<String, BTreeMap<u32, BTreeSet<Label>>>,
}

impl ParticipantTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Utf8Path) -> Result<Self, ParticipantError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| {
            ParticipantError::Read {
                path: path.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Utf8Path, content: &str) -> Result<Self, ParticipantError> {
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let Some((_, header)) = lines.next() else {
            return Ok(Self::empty());
        };
        let delimiter = if path.extension() == Some("tsv") || header.contains('\t') {
            '\t'
        } else {
            ','
        };
        let columns = split_row(header, delimiter);
        let find = |names: &[&str]| {
            columns
                .iter()
                .position(|column| names.contains(&column.to_lowercase().as_str()))
                .ok_or_else(|| ParticipantError::MissingColumn {
                    path: path.to_path_buf(),
                    column: names[0].to_string(),
                })
        };
        let subject_idx = find(SUBJECT_COLUMNS)?;
        let instance_idx = find(INSTANCE_COLUMNS)?;
        let session_idx = find(SESSION_COLUMNS)?;

        let mut table = Self::empty();
        for (index, line) in lines {
            let line_no = index + 1;
            let cells = split_row(line, delimiter);
            let cell = |idx: usize| cells.get(idx).map(String::as_str).unwrap_or("");
            let invalid = |message: String| ParticipantError::InvalidRow {
                path: path.to_path_buf(),
                line: line_no,
                message,
            };

            let subject = cell(subject_idx);
            let instance = cell(instance_idx);
            let session = cell(session_idx);
            if subject.is_empty() {
                return Err(invalid("empty subject".to_string()));
            }
            if is_missing(instance) || is_missing(session) {
                continue;
            }
            let instance = instance
                .parse::<u32>()
                .map_err(|_| invalid(format!("invalid instance {instance:?}")))?;
            let session = session
                .parse::<Label>()
                .map_err(|err| invalid(err.to_string()))?;
            table.insert(subject, instance, session);
        }
        Ok(table)
    }

    pub fn insert(&mut self, subject: &str, instance: u32, session: Label) {
        self.subjects
            .entry(normalize_subject(subject))
            .or_default()
            .entry(instance)
            .or_default()
            .insert(session);
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    /// The session label the table assigns to `(subject, instance)`, `None`
    /// when the table has no row for it. Fails if the subject's rows are
    /// contradictory anywhere, not only for this instance, so every asset of
    /// that subject fails the same way.
    pub fn session_for(
        &self,
        subject: &str,
        instance: u32,
    ) -> Result<Option<Label>, ResolutionError> {
        let Some(instances) = self.subjects.get(&normalize_subject(subject)) else {
            return Ok(None);
        };

        let mut claimed = BTreeMap::<&Label, u32>::new();
        for (inst, sessions) in instances {
            if sessions.len() > 1 {
                let labels = sessions
                    .iter()
                    .map(Label::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(ResolutionError::AmbiguousSession {
                    subject: subject.to_string(),
                    detail: format!("instance {inst} maps to sessions {labels}"),
                });
            }
            for session in sessions {
                if let Some(other) = claimed.insert(session, *inst) {
                    return Err(ResolutionError::AmbiguousSession {
                        subject: subject.to_string(),
                        detail: format!(
                            "session {session} is claimed by instances {other} and {inst}"
                        ),
                    });
                }
            }
        }

        Ok(instances
            .get(&instance)
            .and_then(|sessions| sessions.iter().next().cloned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSummary {
    pub subject: String,
    pub session: Option<String>,
    pub field: Option<u32>,
}

pub fn render_participants_tsv(rows: impl IntoIterator<Item = ParticipantSummary>) -> String {
    let mut subjects = BTreeMap::<String, (BTreeSet<String>, BTreeSet<u32>)>::new();
    for row in rows {
        let entry = subjects.entry(row.subject).or_default();
        if let Some(session) = row.session {
            entry.0.insert(session);
        }
        if let Some(field) = row.field {
            entry.1.insert(field);
        }
    }

    let mut out = String::from("participant_id\tsessions\tfields\n");
    for (subject, (sessions, fields)) in subjects {
        let sessions = if sessions.is_empty() {
            "n/a".to_string()
        } else {
            sessions
                .iter()
                .map(|session| format!("ses-{session}"))
                .collect::<Vec<_>>()
                .join(",")
        };
        let fields = if fields.is_empty() {
            "n/a".to_string()
        } else {
            fields
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        out.push_str(&format!("sub-{subject}\t{sessions}\t{fields}\n"));
    }
    out
}

fn normalize_subject(value: &str) -> String {
    let trimmed = value.trim();
    trimmed.strip_prefix("sub-").unwrap_or(trimmed).to_string()
}

fn split_row(line: &str, delimiter: char) -> Vec<String> {
    line.split(delimiter)
        .map(|cell| cell.trim().trim_matches('"').trim().to_string())
        .collect()
}

fn is_missing(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("n/a") || value.eq_ignore_ascii_case("na")
}
