//! Storage access traits: the seam between the execution engine and
//! whatever holds the records.
//!
//! The engine never owns data. Tables, columns, and indexes are reached
//! through these traits; [`crate::MemDatabase`] is the in-memory reference
//! implementation the tests run against.

use crate::{DataKind, RecordId, Result, TableId, TypedValue};

/// Full-text lookup flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulltextMode {
    /// All query tokens present in one section.
    Match,
    /// All query tokens present in one section within a bounded span.
    Near,
    /// Enough distinct query tokens present.
    Similar,
    /// Regular-expression match against the raw section text.
    Regexp,
}

/// Options for a full-text index lookup.
#[derive(Debug, Clone, Copy)]
pub struct FulltextOpt<'a> {
    pub mode: FulltextMode,
    /// Maximum matched-token span for [`FulltextMode::Near`].
    pub max_interval: i32,
    /// Minimum distinct-token count for [`FulltextMode::Similar`].
    pub similarity_threshold: i32,
    /// Per-section score weights; sections not listed score 1.
    pub weights: &'a [(u32, i32)],
    /// Records below this id may be skipped by the index.
    pub min_record: RecordId,
    /// Exact token position a [`FulltextMode::Near`] match must start at.
    pub phrase_position: Option<u32>,
}

impl Default for FulltextOpt<'_> {
    fn default() -> Self {
        Self {
            mode: FulltextMode::Match,
            max_interval: 10,
            similarity_threshold: 0,
            weights: &[],
            min_record: crate::NIL_RECORD,
            phrase_position: None,
        }
    }
}

/// Bound inclusivity for a range lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub min: Option<TypedValue>,
    pub max: Option<TypedValue>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl RangeQuery {
    pub fn from_op(op: crate::Operator, bound: TypedValue) -> Option<Self> {
        use crate::Operator;
        let (min, max, min_inclusive, max_inclusive) = match op {
            Operator::Less => (None, Some(bound), false, false),
            Operator::LessEqual => (None, Some(bound), false, true),
            Operator::Greater => (Some(bound), None, false, false),
            Operator::GreaterEqual => (Some(bound), None, true, false),
            _ => return None,
        };
        Some(Self {
            min,
            max,
            min_inclusive,
            max_inclusive,
        })
    }
}

impl RangeQuery {
    /// Whether `value` falls inside the range, under loose comparison.
    pub fn contains(&self, value: &TypedValue) -> bool {
        use std::cmp::Ordering;
        if let Some(min) = &self.min {
            match value.compare(min) {
                Some(Ordering::Greater) => {}
                Some(Ordering::Equal) if self.min_inclusive => {}
                _ => return false,
            }
        }
        if let Some(max) = &self.max {
            match value.compare(max) {
                Some(Ordering::Less) => {}
                Some(Ordering::Equal) if self.max_inclusive => {}
                _ => return false,
            }
        }
        true
    }
}

/// A table: record enumeration, key lookup, and column/index access.
pub trait TableProvider {
    fn size(&self) -> u64;

    /// All live record ids in ascending order.
    fn cursor(&self) -> Box<dyn Iterator<Item = RecordId> + '_>;

    fn contains(&self, id: RecordId) -> bool;

    fn column(&self, name: &str) -> Option<&dyn ColumnProvider>;

    /// The key of a record, if the table is keyed.
    fn key_of(&self, id: RecordId) -> Option<TypedValue>;

    /// Reverse key lookup.
    fn lookup_key(&self, key: &TypedValue) -> Option<RecordId>;

    /// An index over `column` usable for `op`, if one exists.
    fn index(&self, column: &str, op: crate::Operator) -> Option<&dyn IndexProvider>;
}

/// A column of a table.
pub trait ColumnProvider {
    fn kind(&self) -> DataKind;

    fn get(&self, id: RecordId) -> TypedValue;

    /// Store a value; interior mutability so the engine can hold the table
    /// behind a shared reference during assignment programs.
    fn set(&self, id: RecordId, value: TypedValue) -> Result<()>;

    /// The table a `Record`-kind column references.
    fn reference_table(&self) -> Option<TableId> {
        None
    }
}

/// Selector callback for index lookups: `(record, score)` pairs.
pub type IndexSink<'a> = &'a mut dyn FnMut(RecordId, i32);

/// An index over one column.
pub trait IndexProvider {
    fn lookup_equal(&self, value: &TypedValue, weights: &[(u32, i32)], sink: IndexSink<'_>);

    fn lookup_range(&self, range: &RangeQuery, sink: IndexSink<'_>);

    fn lookup_prefix(&self, prefix: &str, sink: IndexSink<'_>);

    /// Whether suffix lookup is available (requires a reverse lexicon).
    fn supports_suffix(&self) -> bool {
        false
    }

    fn lookup_suffix(&self, _suffix: &str, _sink: IndexSink<'_>) {}

    fn lookup_fulltext(&self, query: &str, opt: &FulltextOpt<'_>, sink: IndexSink<'_>);
}

/// Resolves table ids to tables, for `Record`-kind column dereference.
pub trait TableResolver {
    fn table(&self, id: TableId) -> Option<&dyn TableProvider>;
}

/// Tokenize `text` into `(position, token)` pairs, splitting on
/// non-alphanumeric bytes. Case-sensitive; positions count tokens, not
/// bytes.
pub fn tokenize(text: &str) -> Vec<(u32, String)> {
    let mut out = Vec::new();
    let mut pos = 0u32;
    for tok in text.split(|c: char| !c.is_alphanumeric()) {
        if tok.is_empty() {
            continue;
        }
        out.push((pos, tok.to_string()));
        pos += 1;
    }
    out
}

/// Whether one section of text satisfies a full-text query.
///
/// `Match` requires every query token; `Near` additionally bounds the span
/// between the outermost matched positions; `Similar` requires at least
/// `threshold` distinct query tokens (minimum 1).
pub fn section_matches(text: &str, query: &str, opt: &FulltextOpt<'_>) -> bool {
    match opt.mode {
        FulltextMode::Regexp => return regexp_matches(text, query),
        _ => {}
    }
    let toks = tokenize(text);
    let qtoks = tokenize(query);
    if qtoks.is_empty() {
        return false;
    }
    match opt.mode {
        FulltextMode::Match => qtoks
            .iter()
            .all(|(_, q)| toks.iter().any(|(_, t)| t == q)),
        FulltextMode::Near => {
            let mut lo = u32::MAX;
            let mut hi = 0u32;
            for (_, q) in &qtoks {
                let mut found = false;
                for (p, t) in &toks {
                    if t == q {
                        lo = lo.min(*p);
                        hi = hi.max(*p);
                        found = true;
                    }
                }
                if !found {
                    return false;
                }
            }
            if let Some(p) = opt.phrase_position {
                if lo != p {
                    return false;
                }
            }
            (hi - lo) as i32 <= opt.max_interval
        }
        FulltextMode::Similar => {
            let threshold = opt.similarity_threshold.max(1);
            let mut seen: Vec<&str> = Vec::new();
            let mut n = 0i32;
            for (_, q) in &qtoks {
                if seen.contains(&q.as_str()) {
                    continue;
                }
                seen.push(q);
                if toks.iter().any(|(_, t)| t == q) {
                    n += 1;
                }
            }
            n >= threshold
        }
        FulltextMode::Regexp => unreachable!(),
    }
}

#[cfg(feature = "regex")]
pub fn regexp_matches(text: &str, pattern: &str) -> bool {
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            log::warn!("invalid regex pattern {:?}: {}", pattern, e);
            false
        }
    }
}

/// Substring fallback when the `regex` feature is disabled.
#[cfg(not(feature = "regex"))]
pub fn regexp_matches(text: &str, pattern: &str) -> bool {
    text.contains(pattern)
}

/// The sections of a column value: each element of a vector, or the value
/// itself as section 1.
pub fn value_sections(value: &TypedValue) -> Vec<(u32, String)> {
    match value {
        TypedValue::Vector(items) => items
            .iter()
            .enumerate()
            .filter_map(|(i, v)| match v {
                TypedValue::Text(s) => Some((i as u32 + 1, s.clone())),
                _ => None,
            })
            .collect(),
        TypedValue::Text(s) => vec![(1, s.clone())],
        _ => Vec::new(),
    }
}
