//! Procedure registry: named callables a program invokes through `Call`.
//!
//! A procedure has a per-record half (`next`) the VM calls, and may also
//! register a selector half the scan executor prefers when the procedure
//! closes a whole filter term, letting it populate the result set directly.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{
    Combinator, Error, IndexProvider, Result, ResultSet, TableProvider, TypedValue,
};

/// A callable invoked once per evaluated record.
pub trait Procedure: Send + Sync {
    /// Called once before a sequential scan that uses this procedure.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Evaluate for the current record; `args` are the popped call
    /// arguments in source order.
    fn next(&self, args: &[TypedValue]) -> Result<TypedValue>;

    /// Called once after the scan.
    fn fin(&self) -> Result<()> {
        Ok(())
    }
}

/// The whole-term fast path of a procedure: fills `res` directly instead
/// of being evaluated per record.
pub trait SelectorProcedure: Send + Sync {
    fn select(
        &self,
        table: &dyn TableProvider,
        index: Option<&dyn IndexProvider>,
        args: &[TypedValue],
        res: &mut ResultSet,
        op: Combinator,
    ) -> Result<()>;
}

struct Entry {
    proc: Arc<dyn Procedure>,
    selector: Option<Arc<dyn SelectorProcedure>>,
}

/// Name-to-procedure registry. Embedders start from
/// [`ProcedureRegistry::with_builtins`] and register their own on top.
#[derive(Default)]
pub struct ProcedureRegistry {
    entries: FxHashMap<String, Entry>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        register_builtins(&mut r);
        r
    }

    pub fn register(&mut self, name: impl Into<String>, proc: Arc<dyn Procedure>) {
        self.entries.insert(
            name.into(),
            Entry {
                proc,
                selector: None,
            },
        );
    }

    /// Register a procedure together with its selector fast path.
    pub fn register_selector(
        &mut self,
        name: impl Into<String>,
        proc: Arc<dyn Procedure>,
        selector: Arc<dyn SelectorProcedure>,
    ) {
        self.entries.insert(
            name.into(),
            Entry {
                proc,
                selector: Some(selector),
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<&dyn Procedure> {
        self.entries
            .get(name)
            .map(|e| e.proc.as_ref())
            .ok_or_else(|| Error::ProcedureNotFound(name.to_string()))
    }

    pub fn selector(&self, name: &str) -> Option<&dyn SelectorProcedure> {
        self.entries
            .get(name)
            .and_then(|e| e.selector.as_deref())
    }
}

macro_rules! scalar_proc {
    ($registry:expr, $name:literal, |$args:ident| $body:expr) => {{
        struct P;
        impl Procedure for P {
            fn next(&self, $args: &[TypedValue]) -> Result<TypedValue> {
                $body
            }
        }
        $registry.register($name, Arc::new(P));
    }};
}

fn text_arg<'a>(name: &str, args: &'a [TypedValue]) -> Result<&'a str> {
    match args.first() {
        Some(TypedValue::Text(s)) => Ok(s),
        other => Err(Error::Selector {
            name: name.to_string(),
            message: format!("expected a text argument, got {:?}", other),
        }),
    }
}

fn register_builtins(r: &mut ProcedureRegistry) {
    scalar_proc!(r, "length", |args| {
        let s = text_arg("length", args)?;
        Ok(TypedValue::Int64(s.chars().count() as i64))
    });
    scalar_proc!(r, "upper", |args| {
        let s = text_arg("upper", args)?;
        Ok(TypedValue::Text(s.to_uppercase()))
    });
    scalar_proc!(r, "lower", |args| {
        let s = text_arg("lower", args)?;
        Ok(TypedValue::Text(s.to_lowercase()))
    });

    struct AllRecords;
    impl Procedure for AllRecords {
        fn next(&self, _args: &[TypedValue]) -> Result<TypedValue> {
            Ok(TypedValue::Bool(true))
        }
    }
    impl SelectorProcedure for AllRecords {
        fn select(
            &self,
            table: &dyn TableProvider,
            _index: Option<&dyn IndexProvider>,
            _args: &[TypedValue],
            res: &mut ResultSet,
            op: Combinator,
        ) -> Result<()> {
            match op {
                Combinator::Or => {
                    for id in table.cursor() {
                        res.add(id, 1);
                    }
                }
                // Every record matches, so the narrowing combinators keep
                // the set as it is.
                Combinator::And | Combinator::Adjust => {}
                Combinator::AndNot => res.clear(),
            }
            Ok(())
        }
    }
    let all = Arc::new(AllRecords);
    r.register_selector("all_records", all.clone(), all);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scalars() {
        let r = ProcedureRegistry::with_builtins();
        let v = r
            .get("length")
            .unwrap()
            .next(&[TypedValue::Text("héllo".into())])
            .unwrap();
        assert_eq!(v, TypedValue::Int64(5));
        let v = r
            .get("upper")
            .unwrap()
            .next(&[TypedValue::Text("abc".into())])
            .unwrap();
        assert_eq!(v, TypedValue::Text("ABC".into()));
    }

    #[test]
    fn test_unknown_procedure() {
        let r = ProcedureRegistry::with_builtins();
        assert!(matches!(
            r.get("nope"),
            Err(Error::ProcedureNotFound(_))
        ));
    }

    #[test]
    fn test_bad_argument_kind() {
        let r = ProcedureRegistry::with_builtins();
        assert!(matches!(
            r.get("lower").unwrap().next(&[TypedValue::Int32(1)]),
            Err(Error::Selector { .. })
        ));
    }

    #[test]
    fn test_all_records_has_selector() {
        let r = ProcedureRegistry::with_builtins();
        assert!(r.selector("all_records").is_some());
        assert!(r.selector("length").is_none());
    }
}
