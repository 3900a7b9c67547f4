// pgvault/src/template/mod.rs
//! Renders backup destination paths and filenames.
//!
//! Templates use `{field}` placeholders; `{{` and `}}` produce literal braces.
//! The set of fields is fixed, see [`TemplateFields`].

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Format of the compact `{timestamp}` field, also used when parsing keys back.
pub const COMPACT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template field `{field}` in `{template}`")]
    UnknownField { field: String, template: String },

    #[error("unterminated placeholder starting at byte {position} in `{template}`")]
    Unterminated { position: usize, template: String },

    #[error("unmatched `}}` at byte {position} in `{template}`")]
    UnmatchedClose { position: usize, template: String },

    #[error("empty placeholder at byte {position} in `{template}`")]
    EmptyPlaceholder { position: usize, template: String },
}

/// Values available to a template, all derived from a single instant.
#[derive(Debug, Clone)]
pub struct TemplateFields {
    pub cluster: String,
    pub database: String,
    pub year: String,
    pub month: String,
    pub day: String,
    pub timestamp: String,
    pub run_id: String,
}

impl TemplateFields {
    pub fn new(cluster: &str, database: &str, run_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            cluster: cluster.to_string(),
            database: database.to_string(),
            year: now.format("%Y").to_string(),
            month: now.format("%m").to_string(),
            day: now.format("%d").to_string(),
            timestamp: now.format(COMPACT_TIMESTAMP_FORMAT).to_string(),
            run_id: run_id.to_string(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        let value = match name {
            "cluster" => &self.cluster,
            "database" => &self.database,
            "year" => &self.year,
            "month" => &self.month,
            "day" => &self.day,
            "timestamp" => &self.timestamp,
            "run_id" => &self.run_id,
            _ => return None,
        };
        Some(value.as_str())
    }
}

/// Renders `template` against `fields`.
pub fn render(template: &str, fields: &TemplateFields) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.char_indices().peekable();

    while let Some((position, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(TemplateError::Unterminated {
                        position,
                        template: template.to_string(),
                    });
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyPlaceholder {
                        position,
                        template: template.to_string(),
                    });
                }
                let value = fields.lookup(name).ok_or_else(|| TemplateError::UnknownField {
                    field: name.to_string(),
                    template: template.to_string(),
                })?;
                out.push_str(value);
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                    continue;
                }
                return Err(TemplateError::UnmatchedClose {
                    position,
                    template: template.to_string(),
                });
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Joins a rendered path and filename with exactly one `/`.
pub fn object_key(path: &str, filename: &str) -> String {
    let path = path.trim_end_matches('/');
    let filename = filename.trim_start_matches('/');
    if path.is_empty() {
        filename.to_string()
    } else {
        format!("{}/{}", path, filename)
    }
}
