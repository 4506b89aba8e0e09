//! In-process reference storage: hash-free ordered key maps, interior
//! mutability for column cells, and live-computed indexes.
//!
//! `MemIndex` answers lookups by scanning its column's current cells, so it
//! can never fall out of sync with writes. That keeps the reference
//! implementation honest; a production backend would maintain real posting
//! lists behind the same [`IndexProvider`] surface.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::access::{
    value_sections, ColumnProvider, FulltextOpt, IndexProvider, IndexSink, RangeQuery,
    TableProvider, TableResolver,
};
use crate::{
    section_matches, DataKind, Error, Operator, RecordId, Result, TableId, TableSchema,
    TypedValue, NIL_RECORD,
};

/// Ordered key representation for keyed tables.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyRepr {
    Int(i64),
    Text(String),
}

impl KeyRepr {
    fn from_value(v: &TypedValue) -> Option<KeyRepr> {
        match v {
            TypedValue::Text(s) => Some(KeyRepr::Text(s.clone())),
            other => other.as_num().map(|n| KeyRepr::Int(n.as_i64_wrapping())),
        }
    }

    fn to_value(&self) -> TypedValue {
        match self {
            KeyRepr::Int(i) => TypedValue::Int64(*i),
            KeyRepr::Text(s) => TypedValue::Text(s.clone()),
        }
    }
}

/// A column: typed cells addressed by record id, mutable behind a shared
/// reference so assignment programs can run during a scan.
pub struct MemColumn {
    name: String,
    kind: DataKind,
    reference: Option<TableId>,
    cells: RefCell<Vec<TypedValue>>,
}

impl MemColumn {
    fn cell(&self, id: RecordId) -> TypedValue {
        if id == NIL_RECORD {
            return TypedValue::Void;
        }
        self.cells
            .borrow()
            .get(id as usize - 1)
            .cloned()
            .unwrap_or(TypedValue::Void)
    }
}

impl ColumnProvider for MemColumn {
    fn kind(&self) -> DataKind {
        self.kind
    }

    fn get(&self, id: RecordId) -> TypedValue {
        self.cell(id)
    }

    fn set(&self, id: RecordId, value: TypedValue) -> Result<()> {
        if id == NIL_RECORD {
            return Err(Error::NotSettable);
        }
        let mut cells = self.cells.borrow_mut();
        let idx = id as usize - 1;
        if idx >= cells.len() {
            cells.resize(idx + 1, TypedValue::Void);
        }
        cells[idx] = value;
        Ok(())
    }

    fn reference_table(&self) -> Option<TableId> {
        self.reference
    }
}

/// What an index over a column can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemIndexKind {
    /// Equality, range, prefix.
    Value,
    /// Tokenized full-text plus everything `Value` answers.
    Text,
    /// `Text` plus suffix lookup (reverse lexicon).
    TextWithSuffix,
}

/// An index over one column. Lookups scan the live cells.
pub struct MemIndex {
    column: Rc<MemColumn>,
    kind: MemIndexKind,
}

impl MemIndex {
    fn each_record(&self, mut f: impl FnMut(RecordId, &TypedValue)) {
        let cells = self.column.cells.borrow();
        for (i, cell) in cells.iter().enumerate() {
            f(i as RecordId + 1, cell);
        }
    }
}

fn section_weight(weights: &[(u32, i32)], section: u32) -> Option<i32> {
    if weights.is_empty() {
        return Some(1);
    }
    weights
        .iter()
        .find(|(s, _)| *s == section)
        .map(|(_, w)| *w)
}

impl IndexProvider for MemIndex {
    fn lookup_equal(&self, value: &TypedValue, weights: &[(u32, i32)], sink: IndexSink<'_>) {
        self.each_record(|id, cell| match cell {
            TypedValue::Vector(items) => {
                for (i, item) in items.iter().enumerate() {
                    if let Some(w) = section_weight(weights, i as u32 + 1) {
                        if item.loose_eq(value) {
                            sink(id, w);
                        }
                    }
                }
            }
            other => {
                if let Some(w) = section_weight(weights, 1) {
                    if other.loose_eq(value) {
                        sink(id, w);
                    }
                }
            }
        });
    }

    fn lookup_range(&self, range: &RangeQuery, sink: IndexSink<'_>) {
        self.each_record(|id, cell| {
            if range.contains(cell) {
                sink(id, 1);
            }
        });
    }

    fn lookup_prefix(&self, prefix: &str, sink: IndexSink<'_>) {
        self.each_record(|id, cell| {
            for (_, text) in value_sections(cell) {
                if text.starts_with(prefix) {
                    sink(id, 1);
                }
            }
        });
    }

    fn supports_suffix(&self) -> bool {
        self.kind == MemIndexKind::TextWithSuffix
    }

    fn lookup_suffix(&self, suffix: &str, sink: IndexSink<'_>) {
        self.each_record(|id, cell| {
            for (_, text) in value_sections(cell) {
                if text.ends_with(suffix) {
                    sink(id, 1);
                }
            }
        });
    }

    fn lookup_fulltext(&self, query: &str, opt: &FulltextOpt<'_>, sink: IndexSink<'_>) {
        self.each_record(|id, cell| {
            if opt.min_record != NIL_RECORD && id < opt.min_record {
                return;
            }
            for (section, text) in value_sections(cell) {
                let Some(w) = section_weight(opt.weights, section) else {
                    continue;
                };
                if section_matches(&text, query, opt) {
                    sink(id, w);
                }
            }
        });
    }
}

/// One table: schema, key map, columns, and indexes.
pub struct MemTable {
    id: TableId,
    schema: TableSchema,
    n: u32,
    keys: Vec<KeyRepr>,
    key_map: BTreeMap<KeyRepr, RecordId>,
    columns: Vec<Rc<MemColumn>>,
    indexes: FxHashMap<String, MemIndex>,
}

impl MemTable {
    fn new(id: TableId, schema: TableSchema) -> Self {
        let columns = schema
            .columns
            .iter()
            .map(|c| {
                Rc::new(MemColumn {
                    name: c.name.clone(),
                    kind: c.kind,
                    reference: c.reference,
                    cells: RefCell::new(Vec::new()),
                })
            })
            .collect();
        Self {
            id,
            schema,
            n: 0,
            keys: Vec::new(),
            key_map: BTreeMap::new(),
            columns,
            indexes: FxHashMap::default(),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Insert a record; on a keyed table a duplicate key returns the
    /// existing record id.
    pub fn insert(&mut self, key: Option<TypedValue>) -> Result<RecordId> {
        let repr = match (&self.schema.key_kind, key) {
            (Some(_), Some(k)) => Some(KeyRepr::from_value(&k).ok_or(Error::TypeCast {
                from: k.kind(),
                to: DataKind::Text,
            })?),
            (Some(_), None) => {
                return Err(Error::MalformedProgram(
                    "keyed table requires a key on insert".into(),
                ))
            }
            (None, _) => None,
        };
        if let Some(repr) = &repr {
            if let Some(&existing) = self.key_map.get(repr) {
                return Ok(existing);
            }
        }
        self.n += 1;
        let id = self.n;
        if let Some(repr) = repr {
            self.key_map.insert(repr.clone(), id);
            self.keys.push(repr);
        }
        for col in &self.columns {
            col.cells.borrow_mut().push(TypedValue::Void);
        }
        Ok(id)
    }

    /// Store a column value, casting into the column's domain.
    pub fn put(&mut self, id: RecordId, column: &str, value: TypedValue) -> Result<()> {
        let col = self
            .columns
            .iter()
            .find(|c| c.name == column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))?;
        let cast = if value.kind() == col.kind || col.kind == DataKind::Vector {
            value
        } else {
            value.cast_to(col.kind)?
        };
        col.set(id, cast)
    }

    /// Declare an index over `column`.
    pub fn create_index(&mut self, column: &str, kind: MemIndexKind) -> Result<()> {
        let col = self
            .columns
            .iter()
            .find(|c| c.name == column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))?;
        if kind != MemIndexKind::Value
            && !matches!(col.kind, DataKind::Text | DataKind::Vector)
        {
            return Err(Error::IndexUnavailable(
                "full-text index requires a text or vector column",
            ));
        }
        self.indexes.insert(
            column.to_string(),
            MemIndex {
                column: Rc::clone(col),
                kind,
            },
        );
        Ok(())
    }
}

impl TableProvider for MemTable {
    fn size(&self) -> u64 {
        self.n as u64
    }

    fn cursor(&self) -> Box<dyn Iterator<Item = RecordId> + '_> {
        Box::new(1..=self.n)
    }

    fn contains(&self, id: RecordId) -> bool {
        id != NIL_RECORD && id <= self.n
    }

    fn column(&self, name: &str) -> Option<&dyn ColumnProvider> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.as_ref() as &dyn ColumnProvider)
    }

    fn key_of(&self, id: RecordId) -> Option<TypedValue> {
        if id == NIL_RECORD {
            return None;
        }
        self.keys.get(id as usize - 1).map(|k| k.to_value())
    }

    fn lookup_key(&self, key: &TypedValue) -> Option<RecordId> {
        let repr = KeyRepr::from_value(key)?;
        self.key_map.get(&repr).copied()
    }

    fn index(&self, column: &str, op: Operator) -> Option<&dyn IndexProvider> {
        let idx = self.indexes.get(column)?;
        let fulltext = matches!(
            op,
            Operator::Match | Operator::Near | Operator::Similar | Operator::Regexp
        );
        if fulltext && idx.kind == MemIndexKind::Value {
            return None;
        }
        Some(idx as &dyn IndexProvider)
    }
}

/// A set of tables plus the id/name maps, implementing [`TableResolver`].
#[derive(Default)]
pub struct MemDatabase {
    tables: Vec<MemTable>,
    by_name: FxHashMap<String, TableId>,
}

impl MemDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&mut self, schema: TableSchema) -> TableId {
        let id = self.tables.len() as TableId + 1;
        self.by_name.insert(schema.name.clone(), id);
        self.tables.push(MemTable::new(id, schema));
        id
    }

    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.by_name.get(name).copied()
    }

    pub fn table_mut(&mut self, id: TableId) -> Option<&mut MemTable> {
        if id == 0 {
            return None;
        }
        self.tables.get_mut(id as usize - 1)
    }

    pub fn provider(&self, id: TableId) -> Option<&dyn TableProvider> {
        if id == 0 {
            return None;
        }
        self.tables.get(id as usize - 1).map(|t| t as &dyn TableProvider)
    }
}

impl TableResolver for MemDatabase {
    fn table(&self, id: TableId) -> Option<&dyn TableProvider> {
        self.provider(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> MemDatabase {
        let mut db = MemDatabase::new();
        let t = db.create_table(
            TableSchema::builder("docs")
                .key(DataKind::Text)
                .column("size", DataKind::Int32)
                .column("body", DataKind::Text)
                .build(),
        );
        let docs = db.table_mut(t).unwrap();
        for (key, size, body) in [
            ("a", 10, "quick brown fox"),
            ("b", 25, "lazy dog"),
            ("c", 40, "quick dog"),
        ] {
            let id = docs.insert(Some(TypedValue::Text(key.into()))).unwrap();
            docs.put(id, "size", TypedValue::Int32(size)).unwrap();
            docs.put(id, "body", TypedValue::Text(body.into())).unwrap();
        }
        docs.create_index("size", MemIndexKind::Value).unwrap();
        docs.create_index("body", MemIndexKind::Text).unwrap();
        db
    }

    fn collect(f: impl Fn(IndexSink<'_>)) -> Vec<(RecordId, i32)> {
        let mut out = Vec::new();
        let mut sink = |id: RecordId, w: i32| out.push((id, w));
        f(&mut sink);
        out.sort_unstable();
        out
    }

    #[test]
    fn test_insert_dedups_keys() {
        let mut db = fixture();
        let t = db.table_id("docs").unwrap();
        let docs = db.table_mut(t).unwrap();
        let again = docs.insert(Some(TypedValue::Text("b".into()))).unwrap();
        assert_eq!(again, 2);
        assert_eq!(docs.size(), 3);
    }

    #[test]
    fn test_key_roundtrip() {
        let db = fixture();
        let t = db.table_id("docs").unwrap();
        let docs = db.provider(t).unwrap();
        assert_eq!(docs.lookup_key(&TypedValue::Text("c".into())), Some(3));
        assert_eq!(docs.key_of(3), Some(TypedValue::Text("c".into())));
        assert_eq!(docs.lookup_key(&TypedValue::Text("zz".into())), None);
    }

    #[test]
    fn test_value_index_range() {
        let db = fixture();
        let t = db.table_id("docs").unwrap();
        let docs = db.provider(t).unwrap();
        let idx = docs.index("size", Operator::Less).unwrap();
        let range = RangeQuery::from_op(Operator::Less, TypedValue::Int32(30)).unwrap();
        let hits = collect(|sink| idx.lookup_range(&range, sink));
        assert_eq!(hits, vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn test_fulltext_index_match() {
        let db = fixture();
        let t = db.table_id("docs").unwrap();
        let docs = db.provider(t).unwrap();
        let idx = docs.index("body", Operator::Match).unwrap();
        let opt = FulltextOpt::default();
        let hits = collect(|sink| idx.lookup_fulltext("quick", &opt, sink));
        assert_eq!(hits, vec![(1, 1), (3, 1)]);
    }

    #[test]
    fn test_fulltext_min_record_skip() {
        let db = fixture();
        let t = db.table_id("docs").unwrap();
        let docs = db.provider(t).unwrap();
        let idx = docs.index("body", Operator::Match).unwrap();
        let opt = FulltextOpt {
            min_record: 3,
            ..FulltextOpt::default()
        };
        let hits = collect(|sink| idx.lookup_fulltext("quick", &opt, sink));
        assert_eq!(hits, vec![(3, 1)]);
    }

    #[test]
    fn test_value_index_rejects_fulltext() {
        let db = fixture();
        let t = db.table_id("docs").unwrap();
        let docs = db.provider(t).unwrap();
        assert!(docs.index("size", Operator::Match).is_none());
        assert!(docs.index("size", Operator::Equal).is_some());
    }

    #[test]
    fn test_fulltext_index_needs_text_column() {
        let mut db = fixture();
        let t = db.table_id("docs").unwrap();
        let docs = db.table_mut(t).unwrap();
        assert!(matches!(
            docs.create_index("size", MemIndexKind::Text),
            Err(Error::IndexUnavailable(_))
        ));
    }

    #[test]
    fn test_put_casts_into_column_domain() {
        let mut db = fixture();
        let t = db.table_id("docs").unwrap();
        let docs = db.table_mut(t).unwrap();
        docs.put(1, "size", TypedValue::Text("99".into())).unwrap();
        assert_eq!(
            docs.column("size").unwrap().get(1),
            TypedValue::Int32(99)
        );
    }
}
