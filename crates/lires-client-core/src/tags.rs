//! Hierarchical tags.
//!
//! A tag is a path of segments joined by [`TAG_SEP`], e.g. `"ml->vision->detection"`.
//! A tag without a separator is a root tag. Whitespace around separators is
//! not significant and is removed by [`normalize`] on every insertion into a
//! [`TagSet`].
//!
//! # Filtering
//!
//! A document matches a tag query `Q` when `Q ⊆ with_parents(document.tags)`
//! (see [`matches`]). Querying a parent therefore finds documents tagged only
//! with one of its descendants, while querying a leaf never matches a document
//! that carries only the leaf's parent.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Segment separator.
pub const TAG_SEP: &str = "->";

/// Trim whitespace around every segment and rejoin. Idempotent.
pub fn normalize(tag: &str) -> String {
    tag.split(TAG_SEP)
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(TAG_SEP)
}

/// A duplicate-free set of normalized tags.
///
/// Every path that adds, removes, or probes a tag normalizes it first,
/// including deserialization, so two spellings of the same tag can never
/// coexist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TagSet {
    tags: HashSet<String>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the (normalized) tag was not present yet.
    pub fn insert(&mut self, tag: impl AsRef<str>) -> bool {
        self.tags.insert(normalize(tag.as_ref()))
    }

    pub fn remove(&mut self, tag: impl AsRef<str>) -> bool {
        self.tags.remove(&normalize(tag.as_ref()))
    }

    pub fn contains(&self, tag: impl AsRef<str>) -> bool {
        self.tags.contains(&normalize(tag.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    /// Tags in lexicographic order, for stable display and comparison.
    pub fn sorted(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.iter().collect();
        out.sort_unstable();
        out
    }

    pub fn union(&self, other: &TagSet) -> TagSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn union_with(&mut self, other: &TagSet) {
        for tag in other.iter() {
            self.insert(tag);
        }
    }

    pub fn difference(&self, other: &TagSet) -> TagSet {
        let mut out = self.clone();
        out.difference_with(other);
        out
    }

    pub fn difference_with(&mut self, other: &TagSet) {
        for tag in other.iter() {
            self.remove(tag);
        }
    }

    /// `true` if every tag of `self` is in `value` (no parent expansion).
    pub fn is_subset_of(&self, value: &TagSet) -> bool {
        is_subset(self, value)
    }

    pub fn with_parents(&self) -> TagSet {
        with_parents(self)
    }

    /// `self` plus every descendant of its members found in `pool`.
    pub fn with_children_from(&self, pool: &TagSet) -> TagSet {
        let mut out = self.clone();
        for tag in self.iter() {
            out.union_with(&all_children_of(tag, pool));
        }
        out
    }

    /// Every proper ancestor of any member.
    pub fn all_parents(&self) -> TagSet {
        let mut out = TagSet::new();
        for tag in self.iter() {
            out.union_with(&all_parents_of(tag));
        }
        out
    }

    pub fn hierarchy(&self) -> TagHierarchy {
        build_hierarchy(self)
    }
}

impl<S: AsRef<str>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut out = TagSet::new();
        out.extend(iter);
        out
    }
}

impl<S: AsRef<str>> Extend<S> for TagSet {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for tag in iter {
            self.insert(tag);
        }
    }
}

impl From<Vec<String>> for TagSet {
    fn from(tags: Vec<String>) -> Self {
        tags.into_iter().collect()
    }
}

impl From<TagSet> for Vec<String> {
    fn from(set: TagSet) -> Self {
        let mut out: Vec<String> = set.tags.into_iter().collect();
        out.sort_unstable();
        out
    }
}

/// All proper prefixes of `tag`: `"a->b->c"` gives `{"a", "a->b"}`.
pub fn all_parents_of(tag: &str) -> TagSet {
    let tag = normalize(tag);
    let segments: Vec<&str> = tag.split(TAG_SEP).collect();
    let mut out = TagSet::new();
    for end in 1..segments.len() {
        out.insert(segments[..end].join(TAG_SEP));
    }
    out
}

/// Members of `pool` that are strict descendants of `tag`.
///
/// The match is on `tag` followed by the separator, so `"ab"` is not a child
/// of `"a"`.
pub fn all_children_of(tag: &str, pool: &TagSet) -> TagSet {
    let prefix = format!("{}{}", normalize(tag), TAG_SEP);
    pool.iter()
        .filter(|t| t.len() > prefix.len() && t.starts_with(&prefix))
        .collect()
}

/// `true` iff every tag in `query` is in `value`, by exact equality.
pub fn is_subset(query: &TagSet, value: &TagSet) -> bool {
    query.iter().all(|q| value.tags.contains(q))
}

/// `tags` together with every ancestor of every member.
pub fn with_parents(tags: &TagSet) -> TagSet {
    let mut out = tags.clone();
    out.union_with(&tags.all_parents());
    out
}

/// Document filter predicate: `query ⊆ with_parents(document_tags)`.
///
/// An empty query matches everything.
pub fn matches(query: &TagSet, document_tags: &TagSet) -> bool {
    if query.is_empty() {
        return true;
    }
    is_subset(query, &with_parents(document_tags))
}

/// Rename `from` to `to` in `tags`, moving its descendants along with it.
///
/// `{"a->b", "a->b->c", "x"}` renamed `a->b` → `d` yields
/// `{"d", "d->c", "x"}`. Returns `None` when `from` is neither a member nor
/// an ancestor of one, i.e. when nothing would change.
pub fn rename_tag(tags: &TagSet, from: &str, to: &str) -> Option<TagSet> {
    let from = normalize(from);
    let to = normalize(to);
    if !with_parents(tags).contains(&from) {
        return None;
    }
    let prefix = format!("{}{}", from, TAG_SEP);
    let renamed = tags
        .iter()
        .map(|tag| {
            if tag == from {
                to.clone()
            } else if tag.starts_with(&prefix) {
                format!("{}{}", to, &tag[from.len()..])
            } else {
                tag.to_string()
            }
        })
        .collect();
    Some(renamed)
}

/// Remove `tag` and all of its descendants. `None` if nothing was removed.
pub fn delete_tag(tags: &TagSet, tag: &str) -> Option<TagSet> {
    let doomed = TagSet::from_iter([tag]).with_children_from(tags);
    let kept = tags.difference(&doomed);
    if kept.len() == tags.len() {
        None
    } else {
        Some(kept)
    }
}

/// A node of a [`TagHierarchy`].
///
/// `tagged` records whether the node's own path is a member of the source
/// set; an intermediate node that only exists because of a descendant has
/// `tagged == false`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagNode {
    pub tagged: bool,
    pub children: BTreeMap<String, TagNode>,
}

/// Tree view of a [`TagSet`]. Every key is a fully-qualified path
/// (`"a"`, `"a->b"`, `"a->b->c"`), children ordered lexicographically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagHierarchy {
    pub roots: BTreeMap<String, TagNode>,
}

/// One entry of a depth-first walk over a [`TagHierarchy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagEntry<'a> {
    pub depth: usize,
    pub path: &'a str,
    pub tagged: bool,
}

impl TagEntry<'_> {
    /// Last segment of the path, for indented display.
    pub fn label(&self) -> &str {
        self.path.rsplit(TAG_SEP).next().unwrap_or(self.path)
    }
}

/// Build the hierarchy of `tags`.
pub fn build_hierarchy(tags: &TagSet) -> TagHierarchy {
    let mut hierarchy = TagHierarchy::default();
    for tag in tags.iter() {
        let segments: Vec<&str> = tag.split(TAG_SEP).collect();
        let last = segments.len() - 1;
        let mut level = &mut hierarchy.roots;
        let mut path = String::new();
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                path.push_str(TAG_SEP);
            }
            path.push_str(segment);
            let node = level.entry(path.clone()).or_default();
            if i == last {
                node.tagged = true;
            }
            level = &mut node.children;
        }
    }
    hierarchy
}

impl TagHierarchy {
    /// Inverse of [`build_hierarchy`]: the set of every tagged path.
    pub fn flatten(&self) -> TagSet {
        self.walk()
            .into_iter()
            .filter(|e| e.tagged)
            .map(|e| e.path)
            .collect()
    }

    /// Pre-order, depth-first traversal.
    pub fn walk(&self) -> Vec<TagEntry<'_>> {
        fn visit<'a>(level: &'a BTreeMap<String, TagNode>, depth: usize, out: &mut Vec<TagEntry<'a>>) {
            for (path, node) in level {
                out.push(TagEntry {
                    depth,
                    path,
                    tagged: node.tagged,
                });
                visit(&node.children, depth + 1, out);
            }
        }
        let mut out = Vec::new();
        visit(&self.roots, 0, &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tags: &[&str]) -> TagSet {
        tags.iter().collect()
    }

    #[test]
    fn normalize_trims_segments() {
        assert_eq!(normalize("  a -> b  ->c "), "a->b->c");
        assert_eq!(normalize("root"), "root");
        assert_eq!(normalize("deep learning -> cv"), "deep learning->cv");
    }

    #[test]
    fn normalize_is_idempotent() {
        for tag in ["a->b", " a -> b ", "x- -> >y", "a -> ->b", "", "->", "  single  "] {
            let once = normalize(tag);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", tag);
        }
    }

    #[test]
    fn set_normalizes_every_mutation() {
        let mut tags = TagSet::new();
        assert!(tags.insert("a -> b"));
        assert!(!tags.insert("a->b"));
        assert!(tags.contains(" a->b "));
        assert_eq!(tags.len(), 1);

        let other = set(&["a ->b", "c"]);
        let union = tags.union(&other);
        assert_eq!(union.sorted(), vec!["a->b", "c"]);

        let diff = union.difference(&set(&["a-> b"]));
        assert_eq!(diff.sorted(), vec!["c"]);

        assert!(tags.remove("a  ->  b"));
        assert!(tags.is_empty());
    }

    #[test]
    fn deserialize_normalizes() {
        let tags: TagSet = serde_json::from_str(r#"["a -> b", "a->b", "c"]"#).unwrap();
        assert_eq!(tags.sorted(), vec!["a->b", "c"]);
        assert_eq!(serde_json::to_string(&tags).unwrap(), r#"["a->b","c"]"#);
    }

    #[test]
    fn parents_of_nested_tag() {
        assert_eq!(all_parents_of("a->b->c").sorted(), vec!["a", "a->b"]);
        assert!(all_parents_of("root").is_empty());
    }

    #[test]
    fn children_respect_separator_boundary() {
        let pool = set(&["a", "ab", "a->b"]);
        assert_eq!(all_children_of("a", &pool).sorted(), vec!["a->b"]);

        let pool = set(&["a", "a->b", "a->b->c", "a->b->d", "b"]);
        assert_eq!(all_children_of("a->b", &pool).sorted(), vec!["a->b->c", "a->b->d"]);
    }

    #[test]
    fn subset_is_exact() {
        assert!(is_subset(&set(&["a"]), &set(&["a", "b"])));
        assert!(!is_subset(&set(&["a"]), &set(&["a->b"])));
        assert!(is_subset(&TagSet::new(), &TagSet::new()));
    }

    #[test]
    fn with_parents_expands_ancestors() {
        let expanded = with_parents(&set(&["a->b->c", "x"]));
        assert_eq!(expanded.sorted(), vec!["a", "a->b", "a->b->c", "x"]);
    }

    #[test]
    fn query_matches_through_parents_only() {
        assert!(matches(&set(&["a"]), &set(&["a->b"])));
        assert!(!matches(&set(&["a->b"]), &set(&["a"])));
        assert!(!matches(&set(&["a->c"]), &set(&["a", "a->b"])));
        assert!(matches(&TagSet::new(), &set(&["anything"])));
        assert!(matches(&TagSet::new(), &TagSet::new()));
    }

    #[test]
    fn hierarchy_keys_are_qualified() {
        let tree = build_hierarchy(&set(&["a->b->c", "a->d", "e"]));
        let a = &tree.roots["a"];
        assert!(!a.tagged);
        assert!(a.children.contains_key("a->b"));
        assert!(a.children["a->b"].children.contains_key("a->b->c"));
        assert!(a.children["a->d"].tagged);
        assert!(tree.roots["e"].tagged);
    }

    #[test]
    fn hierarchy_round_trip() {
        for tags in [
            set(&["a->b->c", "a->d", "e"]),
            set(&["a", "a->b"]),
            set(&["a->b"]),
            set(&["x", "x->y", "x->y->z", "w->v"]),
            TagSet::new(),
        ] {
            assert_eq!(build_hierarchy(&tags).flatten(), tags);
        }
    }

    #[test]
    fn leaf_and_prefix_are_distinct_nodes() {
        let both = build_hierarchy(&set(&["a", "a->b"]));
        let only_child = build_hierarchy(&set(&["a->b"]));
        assert_ne!(both, only_child);
        assert!(both.roots["a"].tagged);
        assert!(both.roots["a"].children["a->b"].tagged);
    }

    #[test]
    fn walk_is_depth_first() {
        let tree = build_hierarchy(&set(&["a->b", "c"]));
        let entries = tree.walk();
        let labels: Vec<(usize, &str)> = entries.iter().map(|e| (e.depth, e.label())).collect();
        assert_eq!(labels, vec![(0, "a"), (1, "b"), (0, "c")]);
    }

    #[test]
    fn rename_moves_descendants() {
        let tags = set(&["a->b", "a->b->c", "x", "a->bc"]);
        let renamed = rename_tag(&tags, "a->b", "d").unwrap();
        assert_eq!(renamed.sorted(), vec!["a->bc", "d", "d->c", "x"]);
    }

    #[test]
    fn rename_through_implicit_parent() {
        let renamed = rename_tag(&set(&["a->b"]), "a", "z").unwrap();
        assert_eq!(renamed.sorted(), vec!["z->b"]);
        assert!(rename_tag(&set(&["a->b"]), "q", "z").is_none());
    }

    #[test]
    fn delete_removes_subtree() {
        let tags = set(&["a->b", "a->b->c", "b->c", "a->bc"]);
        let kept = delete_tag(&tags, "a->b").unwrap();
        assert_eq!(kept.sorted(), vec!["a->bc", "b->c"]);
        assert!(delete_tag(&tags, "zzz").is_none());
    }
}
