//! Document records as served by the Lires server.
//!
//! The wire shape is the server's "datapoint summary". Supplementary text
//! (note, abstract) is not part of the summary and is fetched lazily.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::tags::TagSet;

/// Reserved id of the placeholder record handed to presentation code for
/// ids that are not (or no longer) in the index.
pub const PLACEHOLDER_ID: &str = " ";

/// Lazily fetched text that is not part of the summary. `None` means
/// "not fetched yet", not "empty".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Supplement {
    pub note: Option<String>,
    pub abstract_text: Option<String>,
}

/// One document summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(rename = "uuid")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub year: String,
    /// Primary author.
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub publication: Option<String>,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub has_file: bool,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Epoch seconds.
    #[serde(default)]
    pub time_added: f64,
    /// Epoch seconds.
    #[serde(default)]
    pub time_modified: f64,
    #[serde(default)]
    pub bibtex: String,
    #[serde(default)]
    pub doc_size: f64,
    #[serde(default)]
    pub note_linecount: u32,
    #[serde(default)]
    pub has_abstract: bool,
    #[serde(skip)]
    pub supplement: Supplement,
}

/// How a record's document can be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    Pdf,
    Html,
    /// No file, but an external URL.
    Url,
    /// Neither file nor URL.
    None,
    Unknown,
}

impl DocumentRecord {
    /// Minimal record with the given id; every other field is empty.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            year: String::new(),
            author: String::new(),
            authors: Vec::new(),
            publication: None,
            tags: TagSet::new(),
            has_file: false,
            file_type: String::new(),
            url: None,
            time_added: 0.0,
            time_modified: 0.0,
            bibtex: String::new(),
            doc_size: 0.0,
            note_linecount: 0,
            has_abstract: false,
            supplement: Supplement::default(),
        }
    }

    /// The placeholder record, see [`PLACEHOLDER_ID`].
    pub fn placeholder() -> Self {
        Self {
            title: " ".to_string(),
            year: "0000".to_string(),
            author: " ".to_string(),
            authors: vec![" ".to_string()],
            ..Self::new(PLACEHOLDER_ID)
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.id == PLACEHOLDER_ID
    }

    /// `"First Author et al."`, or just the first author when alone.
    pub fn author_abbr(&self) -> String {
        let first = self.authors.first().map(String::as_str).unwrap_or(&self.author);
        if self.authors.len() > 1 {
            format!("{} et al.", first)
        } else {
            first.to_string()
        }
    }

    pub fn author_year(&self) -> String {
        format!("{} {}", self.author_abbr(), self.year)
    }

    pub fn year_author(&self, hyphen: &str) -> String {
        format!("{}{}{}", self.year, hyphen, self.author_abbr())
    }

    fn external_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.is_empty())
    }

    pub fn doc_type(&self) -> DocType {
        match (self.has_file, self.file_type.as_str(), self.external_url()) {
            (true, ".pdf", _) => DocType::Pdf,
            (true, ".html", _) => DocType::Html,
            (false, _, Some(_)) => DocType::Url,
            (false, _, None) => DocType::None,
            _ => DocType::Unknown,
        }
    }

    /// URL of the raw document: the server copy if there is a file,
    /// otherwise the external URL, otherwise `about:blank`.
    pub fn raw_doc_url(&self, backend: &str) -> String {
        if self.has_file {
            return format!("{}/doc/{}", backend.trim_end_matches('/'), self.id);
        }
        self.external_url().unwrap_or("about:blank").to_string()
    }

    /// `title|authors|year`, the haystack of the `general` search field.
    pub fn general_text(&self) -> String {
        format!("{}|{}|{}", self.title, self.authors.join(", "), self.year)
    }

    pub fn added_at(&self) -> Option<DateTime<Utc>> {
        epoch_to_utc(self.time_added)
    }

    /// Cache `note` and recompute the summary's line count.
    pub fn set_note(&mut self, note: String) {
        self.note_linecount = count_note_lines(&note);
        self.supplement.note = Some(note);
    }

    pub fn set_abstract(&mut self, text: String) {
        self.has_abstract = !text.trim().is_empty();
        self.supplement.abstract_text = Some(text);
    }
}

impl fmt::Display for DocumentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} ({}) [uid: {}]",
            self.title,
            self.author_abbr(),
            self.year,
            self.id
        )
    }
}

/// Number of non-blank lines, the server's `note_linecount`.
pub fn count_note_lines(note: &str) -> u32 {
    note.lines().filter(|l| !l.trim().is_empty()).count() as u32
}

fn epoch_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
    DateTime::from_timestamp(whole, nanos.min(999_999_999))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}
