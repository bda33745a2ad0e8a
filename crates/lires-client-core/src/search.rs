//! Document filtering and ordering.
//!
//! A search narrows a candidate list of records by one field selector and a
//! pattern. Most selectors are evaluated locally; `feature` (semantic
//! similarity) and `note` (full-text over notes) need the server and go
//! through a [`RemoteSearch`] implementation, one call per [`filter`].
//!
//! # Orderings
//!
//! - **Default**: descending `time_added`, stable, so records with equal
//!   timestamps keep their input order.
//! - **Score**: descending relevance (ascending when reversed), producing
//!   parallel record/score vectors. Only `feature` results are score
//!   ordered; everything else comes back in default order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::DocumentRecord;

/// Which derived string a pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchField {
    /// `title|authors|year`.
    General,
    Title,
    Id,
    Author,
    /// Prefix of the year string.
    Year,
    Publication,
    /// Semantic similarity, scored by the server.
    Feature,
    /// Full-text over notes, evaluated by the server.
    Note,
}

impl SearchField {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchField::General => "general",
            SearchField::Title => "title",
            SearchField::Id => "id",
            SearchField::Author => "author",
            SearchField::Year => "year",
            SearchField::Publication => "publication",
            SearchField::Feature => "feature",
            SearchField::Note => "note",
        }
    }

    /// `true` for selectors the server evaluates.
    pub fn is_remote(self) -> bool {
        matches!(self, SearchField::Feature | SearchField::Note)
    }
}

impl fmt::Display for SearchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(SearchField::General),
            "title" => Ok(SearchField::Title),
            "id" | "uuid" => Ok(SearchField::Id),
            "author" => Ok(SearchField::Author),
            "year" => Ok(SearchField::Year),
            "publication" => Ok(SearchField::Publication),
            "feature" => Ok(SearchField::Feature),
            "note" => Ok(SearchField::Note),
            other => Err(Error::InvalidArgument(format!(
                "unknown search selector: {:?}",
                other
            ))),
        }
    }
}

/// Ids (and, for scored selectors, relevance) returned by the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteHits {
    pub ids: Vec<String>,
    /// Parallel to `ids` when present.
    pub scores: Option<Vec<f64>>,
}

/// Server-side evaluation of remote selectors.
#[async_trait]
pub trait RemoteSearch: Send + Sync {
    async fn search(&self, field: SearchField, pattern: &str) -> Result<RemoteHits>;
}

/// Result of a [`filter`]. `scores`, when present, is parallel to
/// `records`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome<'a> {
    pub records: Vec<&'a DocumentRecord>,
    pub scores: Option<Vec<f64>>,
}

impl<'a> SearchOutcome<'a> {
    fn unscored(records: Vec<&'a DocumentRecord>) -> Self {
        Self {
            records,
            scores: None,
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Sort by descending `time_added`. Stable.
pub fn sort_default(records: &mut [&DocumentRecord]) {
    records.sort_by(|a, b| b.time_added.total_cmp(&a.time_added));
}

/// Reorder `items` by `scores`, descending unless `reverse`. Stable; the
/// returned vectors stay pairwise aligned.
pub fn sort_by_score<T>(items: Vec<T>, scores: Vec<f64>, reverse: bool) -> Result<(Vec<T>, Vec<f64>)> {
    if items.len() != scores.len() {
        return Err(Error::LengthMismatch {
            records: items.len(),
            scores: scores.len(),
        });
    }
    let mut pairs: Vec<(T, f64)> = items.into_iter().zip(scores).collect();
    if reverse {
        pairs.sort_by(|a, b| a.1.total_cmp(&b.1));
    } else {
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));
    }
    Ok(pairs.into_iter().unzip())
}

/// Canonical `"family, given"` form of an author name: lowercase, hyphens
/// removed. An existing comma is taken as the family/given split; otherwise
/// the last space is.
pub fn format_author_name(name: &str) -> String {
    let name = name.trim().to_lowercase().replace('-', "");
    if let Some((family, given)) = name.split_once(',') {
        return format!("{}, {}", family.trim(), given.trim());
    }
    match name.rfind(' ') {
        Some(split) => format!("{}, {}", name[split + 1..].trim(), name[..split].trim()),
        None => name,
    }
}

fn record_authors(record: &DocumentRecord) -> Vec<&str> {
    if record.authors.is_empty() && !record.author.is_empty() {
        vec![record.author.as_str()]
    } else {
        record.authors.iter().map(String::as_str).collect()
    }
}

fn contains_ci(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

fn author_matches(records: &[&DocumentRecord], pattern: &str) -> Vec<usize> {
    let mut by_author: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        for author in record_authors(record) {
            let positions = by_author.entry(format_author_name(author)).or_default();
            if positions.last() != Some(&i) {
                positions.push(i);
            }
        }
    }

    let query = format_author_name(pattern);
    if let Some(exact) = by_author.get(&query) {
        return exact.clone();
    }
    let hits: BTreeSet<usize> = by_author
        .iter()
        .filter(|(name, _)| name.contains(&query))
        .flat_map(|(_, positions)| positions.iter().copied())
        .collect();
    hits.into_iter().collect()
}

/// Evaluate a local selector. Remote selectors are an invalid argument here.
pub fn filter_local<'a>(
    records: Vec<&'a DocumentRecord>,
    field: SearchField,
    pattern: &str,
) -> Result<SearchOutcome<'a>> {
    if field.is_remote() {
        return Err(Error::InvalidArgument(format!(
            "selector {} requires a server",
            field
        )));
    }
    let pattern = pattern.trim();
    let mut selected: Vec<&DocumentRecord> = if pattern.is_empty() {
        records
    } else if field == SearchField::Author {
        author_matches(&records, pattern)
            .into_iter()
            .map(|i| records[i])
            .collect()
    } else {
        let needle = pattern.to_lowercase();
        records
            .into_iter()
            .filter(|r| match field {
                SearchField::General => contains_ci(&r.general_text(), &needle),
                SearchField::Title => contains_ci(&r.title, &needle),
                SearchField::Id => contains_ci(&r.id, &needle),
                SearchField::Publication => r
                    .publication
                    .as_deref()
                    .is_some_and(|p| contains_ci(p, &needle)),
                SearchField::Year => r.year.starts_with(pattern),
                SearchField::Author | SearchField::Feature | SearchField::Note => false,
            })
            .collect()
    };
    sort_default(&mut selected);
    Ok(SearchOutcome::unscored(selected))
}

/// Intersect `records` with server hits. `feature` results are score
/// ordered when the server sent scores; everything else is default ordered.
pub fn apply_remote<'a>(
    records: Vec<&'a DocumentRecord>,
    field: SearchField,
    hits: RemoteHits,
) -> Result<SearchOutcome<'a>> {
    match hits.scores {
        Some(scores) if field == SearchField::Feature => {
            if scores.len() != hits.ids.len() {
                return Err(Error::LengthMismatch {
                    records: hits.ids.len(),
                    scores: scores.len(),
                });
            }
            let score_of: HashMap<&str, f64> = hits
                .ids
                .iter()
                .map(String::as_str)
                .zip(scores)
                .collect();
            let (selected, scores): (Vec<_>, Vec<_>) = records
                .into_iter()
                .filter_map(|r| score_of.get(r.id.as_str()).map(|s| (r, *s)))
                .unzip();
            let (selected, scores) = sort_by_score(selected, scores, false)?;
            Ok(SearchOutcome {
                records: selected,
                scores: Some(scores),
            })
        }
        _ => {
            let wanted: HashSet<&str> = hits.ids.iter().map(String::as_str).collect();
            let mut selected: Vec<_> = records
                .into_iter()
                .filter(|r| wanted.contains(r.id.as_str()))
                .collect();
            sort_default(&mut selected);
            Ok(SearchOutcome::unscored(selected))
        }
    }
}

/// Filter `records` by `selector` and `pattern`.
///
/// An empty pattern returns every candidate in default order without
/// consulting the server.
pub async fn filter<'a, R>(
    records: Vec<&'a DocumentRecord>,
    selector: &str,
    pattern: &str,
    remote: &R,
) -> Result<SearchOutcome<'a>>
where
    R: RemoteSearch + ?Sized,
{
    let field: SearchField = selector.parse()?;
    if pattern.trim().is_empty() || !field.is_remote() {
        let field = if field.is_remote() { SearchField::General } else { field };
        return filter_local(records, field, pattern);
    }
    let hits = remote.search(field, pattern).await?;
    apply_remote(records, field, hits)
}
