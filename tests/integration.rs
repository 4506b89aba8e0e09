// Integration tests for filterscan: end-to-end planning, index selection,
// and sequential fallback over the in-memory database.

use filterscan::*;
use proptest::prelude::*;

/// Two-table fixture: a `brands` key table and a `products` table whose
/// `brand` column references it. Prices are 50/100/150/900 so threshold
/// comparisons land on, below, and above record values.
fn make_db(indexed: bool) -> (MemDatabase, TableId) {
    let mut db = MemDatabase::new();
    let brands = db.create_table(TableSchema::builder("brands").key(DataKind::Text).build());
    let bt = db.table_mut(brands).unwrap();
    let acme = bt.insert(Some(TypedValue::Text("acme".into()))).unwrap();
    let globex = bt.insert(Some(TypedValue::Text("globex".into()))).unwrap();

    let t = db.create_table(
        TableSchema::builder("products")
            .key(DataKind::Text)
            .column("price", DataKind::Int32)
            .column("title", DataKind::Text)
            .column("status", DataKind::Text)
            .reference_column("brand", brands)
            .build(),
    );
    let p = db.table_mut(t).unwrap();
    for (key, price, title, status, brand) in [
        ("alpha", 50, "small gray cat", "live", acme),
        ("beta", 100, "large brown dog", "live", globex),
        ("gamma", 150, "striped orange cat", "deleted", acme),
        ("delta", 900, "green parrot", "live", globex),
    ] {
        let id = p.insert(Some(TypedValue::Text(key.into()))).unwrap();
        p.put(id, "price", TypedValue::Int32(price)).unwrap();
        p.put(id, "title", TypedValue::Text(title.into())).unwrap();
        p.put(id, "status", TypedValue::Text(status.into())).unwrap();
        p.put(id, "brand", TypedValue::Record { table: brands, id: brand })
            .unwrap();
    }
    if indexed {
        p.create_index("price", MemIndexKind::Value).unwrap();
        p.create_index("title", MemIndexKind::Text).unwrap();
        p.create_index("status", MemIndexKind::Value).unwrap();
    }
    (db, t)
}

fn run_select(db: &MemDatabase, mut program: Program) -> ResultSet {
    let procs = ProcedureRegistry::with_builtins();
    select(
        db,
        &procs,
        &mut program,
        None,
        Combinator::Or,
        &ScanConfig::default(),
    )
    .unwrap()
}

fn run_seeded(
    db: &MemDatabase,
    mut program: Program,
    seed: ResultSet,
    outer: Combinator,
) -> ResultSet {
    let procs = ProcedureRegistry::with_builtins();
    select(
        db,
        &procs,
        &mut program,
        Some(seed),
        outer,
        &ScanConfig::default(),
    )
    .unwrap()
}

/// Reference result: evaluate the whole program with the VM for every
/// record, no planning involved.
fn brute_force(db: &MemDatabase, table: TableId, program: &Program) -> Vec<RecordId> {
    let procs = ProcedureRegistry::with_builtins();
    let tp = db.provider(table).unwrap();
    let ctx = EvalContext {
        table: tp,
        tables: db,
        procs: &procs,
    };
    let mut vm = Vm::new();
    tp.cursor()
        .filter(|&id| {
            vm.eval(program, &ctx, id)
                .map(|v| v.is_truthy())
                .unwrap_or(false)
        })
        .collect()
}

fn cmp(b: &mut ProgramBuilder, col: &str, op: Operator, v: TypedValue) {
    b.column(col);
    b.constant(v);
    b.op(op, 2);
}

fn cmp_program(t: TableId, col: &str, op: Operator, v: TypedValue) -> Program {
    let mut b = ProgramBuilder::new(t);
    cmp(&mut b, col, op, v);
    b.finish().unwrap()
}

#[test]
fn test_range_scan_selects_below_threshold() {
    let (db, t) = make_db(true);
    let program = cmp_program(t, "price", Operator::Less, TypedValue::Int32(100));
    let res = run_select(&db, program);
    assert_eq!(res.ids(), vec![1]);
    assert_eq!(res.score(1), Some(1));

    let program = cmp_program(t, "price", Operator::Less, TypedValue::Int32(100));
    assert_eq!(brute_force(&db, t, &program), vec![1]);
}

#[test]
fn test_indexed_and_sequential_conjunction_agree() {
    let build = |t: TableId| {
        let mut b = ProgramBuilder::new(t);
        cmp(&mut b, "title", Operator::Match, TypedValue::Text("cat".into()));
        cmp(&mut b, "price", Operator::Less, TypedValue::Int32(120));
        b.op(Operator::And, 2);
        b.finish().unwrap()
    };
    let (idx_db, it) = make_db(true);
    let (seq_db, st) = make_db(false);
    let via_index = run_select(&idx_db, build(it));
    let via_scan = run_select(&seq_db, build(st));
    assert_eq!(via_index.ids(), vec![1]);
    assert_eq!(via_index.ids(), via_scan.ids());
    // Both the match and the comparison contribute a score point either way.
    assert_eq!(via_index.score(1), via_scan.score(1));
}

#[test]
fn test_negated_equality_plans_single_flipped_step() {
    let (db, t) = make_db(true);
    let mut b = ProgramBuilder::new(t);
    cmp(&mut b, "status", Operator::Equal, TypedValue::Text("deleted".into()));
    b.op(Operator::Not, 1);
    let program = b.finish().unwrap();

    let plan = build_plan(&program, db.provider(t).unwrap(), Combinator::Or, 0)
        .expect("negated equality is plannable");
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].op, Operator::NotEqual);
    assert!(plan.steps.iter().all(|s| s.op != Operator::Call));

    let res = run_select(&db, program);
    assert_eq!(res.ids(), vec![1, 2, 4]);
}

#[test]
fn test_negated_disjunction_falls_back_to_sequential() {
    let build = |t: TableId| {
        let mut b = ProgramBuilder::new(t);
        cmp(&mut b, "title", Operator::Match, TypedValue::Text("cat".into()));
        cmp(&mut b, "title", Operator::Match, TypedValue::Text("parrot".into()));
        b.op(Operator::Or, 2);
        b.op(Operator::Not, 1);
        b.finish().unwrap()
    };
    let (db, t) = make_db(true);
    let program = build(t);
    assert!(
        build_plan(&program, db.provider(t).unwrap(), Combinator::Or, 0).is_none(),
        "trailing negated group has no index rewrite"
    );
    let res = run_select(&db, build(t));
    assert_eq!(res.ids(), brute_force(&db, t, &program));
    assert_eq!(res.ids(), vec![2]);
}

#[test]
fn test_negated_group_under_or_subtracts_from_all_records() {
    // deleted || !(title @ "cat" && price < 120) plans as an all-records
    // subtraction and matches the sequential result.
    let build = |t: TableId| {
        let mut b = ProgramBuilder::new(t);
        cmp(&mut b, "status", Operator::Equal, TypedValue::Text("deleted".into()));
        cmp(&mut b, "title", Operator::Match, TypedValue::Text("cat".into()));
        cmp(&mut b, "price", Operator::Less, TypedValue::Int32(120));
        b.op(Operator::And, 2);
        b.op(Operator::Not, 1);
        b.op(Operator::Or, 2);
        b.finish().unwrap()
    };
    let (db, t) = make_db(true);
    let program = build(t);
    assert!(
        build_plan(&program, db.provider(t).unwrap(), Combinator::Or, 0).is_some(),
        "negated group consumed by Or is plannable"
    );
    let res = run_select(&db, build(t));
    assert_eq!(res.ids(), brute_force(&db, t, &program));
    assert_eq!(res.ids(), vec![2, 3, 4]);
}

#[test]
fn test_id_accessor_agrees_with_sequential_for_loose_queries() {
    let (db, t) = make_db(true);
    // A fractional id designates no record, exactly as the VM compares it.
    let program = cmp_program(t, "_id", Operator::Equal, TypedValue::Float(2.5));
    assert_eq!(brute_force(&db, t, &program), Vec::<RecordId>::new());
    assert!(run_select(&db, program).is_empty());
    // Numeric text resolves to the record the VM's loose comparison finds.
    let program = cmp_program(t, "_id", Operator::Equal, TypedValue::Text("2".into()));
    assert_eq!(brute_force(&db, t, &program), vec![2]);
    assert_eq!(run_select(&db, program).ids(), vec![2]);
    // An integral float works on both paths too.
    let program = cmp_program(t, "_id", Operator::Equal, TypedValue::Float(3.0));
    assert_eq!(brute_force(&db, t, &program), vec![3]);
    assert_eq!(run_select(&db, program).ids(), vec![3]);
}

#[test]
fn test_wide_truthy_result_counts_as_hit() {
    // A truthy value outside the i32 score range still marks the record as
    // matched instead of wrapping to a zero score.
    let (db, t) = make_db(true);
    let mut b = ProgramBuilder::new(t);
    b.constant(TypedValue::Int64(1i64 << 32));
    let program = b.finish().unwrap();
    assert_eq!(brute_force(&db, t, &program), vec![1, 2, 3, 4]);
    let res = run_select(&db, program);
    assert_eq!(res.ids(), vec![1, 2, 3, 4]);
    assert_eq!(res.score(1), Some(1));
}

#[test]
fn test_division_by_zero_skips_record_and_continues() {
    // price / (price - 100) == 1 divides by zero exactly for the record
    // priced 100; that record scores zero and the scan keeps going.
    let (db, t) = make_db(true);
    let mut b = ProgramBuilder::new(t);
    b.column("price");
    b.column("price");
    b.constant(TypedValue::Int32(100));
    b.op(Operator::Minus, 2);
    b.op(Operator::Slash, 2);
    b.constant(TypedValue::Int32(1));
    b.op(Operator::Equal, 2);
    let res = run_select(&db, b.finish().unwrap());
    // 900 / 800 == 1 in integer division; everything else misses.
    assert_eq!(res.ids(), vec![4]);
}

#[test]
fn test_reference_inequality_is_statically_true() {
    let (db, t) = make_db(true);
    let program = cmp_program(
        t,
        "brand",
        Operator::NotEqual,
        TypedValue::Text("missing".into()),
    );
    let table = db.provider(t).unwrap();
    let ex = specialize(&program, table).unwrap();
    assert!(matches!(ex, Executor::Static(true)));

    let res = run_select(&db, program);
    assert_eq!(res.ids(), vec![1, 2, 3, 4]);
}

#[test]
fn test_seeded_and_narrows_previous_result() {
    let (db, t) = make_db(true);
    let seed = run_select(
        &db,
        cmp_program(t, "status", Operator::Equal, TypedValue::Text("live".into())),
    );
    assert_eq!(seed.ids(), vec![1, 2, 4]);
    let res = run_seeded(
        &db,
        cmp_program(t, "price", Operator::Greater, TypedValue::Int32(90)),
        seed,
        Combinator::And,
    );
    assert_eq!(res.ids(), vec![2, 4]);
}

#[test]
fn test_empty_seed_with_narrowing_outer_is_empty() {
    let (db, t) = make_db(true);
    let res = run_seeded(
        &db,
        cmp_program(t, "price", Operator::Greater, TypedValue::Int32(0)),
        ResultSet::new(),
        Combinator::And,
    );
    assert!(res.is_empty());
}

fn comparison_op() -> impl Strategy<Value = Operator> {
    prop_oneof![
        Just(Operator::Equal),
        Just(Operator::NotEqual),
        Just(Operator::Less),
        Just(Operator::LessEqual),
        Just(Operator::Greater),
        Just(Operator::GreaterEqual),
    ]
}

proptest! {
    /// The planned/indexed path selects exactly the records the VM says
    /// satisfy the program.
    #[test]
    fn select_matches_brute_force(op in comparison_op(), c in -50i32..1000) {
        let (db, t) = make_db(true);
        let program = cmp_program(t, "price", op, TypedValue::Int32(c));
        let res = run_select(&db, cmp_program(t, "price", op, TypedValue::Int32(c)));
        prop_assert_eq!(res.ids(), brute_force(&db, t, &program));
    }

    /// A doubly negated comparison selects the same records as the plain
    /// one.
    #[test]
    fn double_negation_is_identity(c in -50i32..1000) {
        let (db, t) = make_db(true);
        let plain = run_select(
            &db,
            cmp_program(t, "price", Operator::Less, TypedValue::Int32(c)),
        );
        let mut b = ProgramBuilder::new(t);
        cmp(&mut b, "price", Operator::Less, TypedValue::Int32(c));
        b.op(Operator::Not, 1);
        b.op(Operator::Not, 1);
        let doubled = run_select(&db, b.finish().unwrap());
        prop_assert_eq!(plain.ids(), doubled.ids());
    }

    /// Union membership does not depend on operand order.
    #[test]
    fn or_is_commutative(a in -50i32..1000, b in -50i32..1000) {
        let (db, t) = make_db(true);
        let left = {
            let mut p = ProgramBuilder::new(t);
            cmp(&mut p, "price", Operator::Less, TypedValue::Int32(a));
            cmp(&mut p, "price", Operator::Greater, TypedValue::Int32(b));
            p.op(Operator::Or, 2);
            run_select(&db, p.finish().unwrap())
        };
        let right = {
            let mut p = ProgramBuilder::new(t);
            cmp(&mut p, "price", Operator::Greater, TypedValue::Int32(b));
            cmp(&mut p, "price", Operator::Less, TypedValue::Int32(a));
            p.op(Operator::Or, 2);
            run_select(&db, p.finish().unwrap())
        };
        prop_assert_eq!(left.ids(), right.ids());
    }

    /// Intersection membership does not depend on operand order.
    #[test]
    fn and_is_commutative(a in -50i32..1000, b in -50i32..1000) {
        let (db, t) = make_db(true);
        let left = {
            let mut p = ProgramBuilder::new(t);
            cmp(&mut p, "price", Operator::GreaterEqual, TypedValue::Int32(a));
            cmp(&mut p, "price", Operator::LessEqual, TypedValue::Int32(b));
            p.op(Operator::And, 2);
            run_select(&db, p.finish().unwrap())
        };
        let right = {
            let mut p = ProgramBuilder::new(t);
            cmp(&mut p, "price", Operator::LessEqual, TypedValue::Int32(b));
            cmp(&mut p, "price", Operator::GreaterEqual, TypedValue::Int32(a));
            p.op(Operator::And, 2);
            run_select(&db, p.finish().unwrap())
        };
        prop_assert_eq!(left.ids(), right.ids());
    }

    /// An and-not pass only ever removes records from the seed.
    #[test]
    fn and_not_only_removes(a in -50i32..1000, b in -50i32..1000) {
        let (db, t) = make_db(true);
        let seed = run_select(
            &db,
            cmp_program(t, "price", Operator::Less, TypedValue::Int32(a)),
        );
        let seed_ids = seed.ids();
        let res = run_seeded(
            &db,
            cmp_program(t, "price", Operator::Greater, TypedValue::Int32(b)),
            seed,
            Combinator::AndNot,
        );
        prop_assert!(res.ids().iter().all(|id| seed_ids.contains(id)));
    }

    /// An adjust pass never changes membership, only scores.
    #[test]
    fn adjust_never_removes(a in -50i32..1000, b in -50i32..1000) {
        let (db, t) = make_db(true);
        let seed = run_select(
            &db,
            cmp_program(t, "price", Operator::Less, TypedValue::Int32(a)),
        );
        let seed_ids = seed.ids();
        let res = run_seeded(
            &db,
            cmp_program(t, "price", Operator::Greater, TypedValue::Int32(b)),
            seed,
            Combinator::Adjust,
        );
        prop_assert_eq!(res.ids(), seed_ids);
    }

    /// A constant on the left of a directional comparison selects the same
    /// records as the flipped form with the constant on the right.
    #[test]
    fn range_flip_is_equivalent(op in prop_oneof![
        Just(Operator::Less),
        Just(Operator::LessEqual),
        Just(Operator::Greater),
        Just(Operator::GreaterEqual),
    ], c in -50i32..1000) {
        let (db, t) = make_db(true);
        // c <op> price
        let mut pre = ProgramBuilder::new(t);
        pre.constant(TypedValue::Int32(c));
        pre.column("price");
        pre.op(op, 2);
        let pre_res = run_select(&db, pre.finish().unwrap());
        // price <flipped op> c
        let flipped = match op {
            Operator::Less => Operator::Greater,
            Operator::LessEqual => Operator::GreaterEqual,
            Operator::Greater => Operator::Less,
            Operator::GreaterEqual => Operator::LessEqual,
            _ => unreachable!(),
        };
        let post_res = run_select(&db, cmp_program(t, "price", flipped, TypedValue::Int32(c)));
        prop_assert_eq!(pre_res.ids(), post_res.ids());
    }

    /// The specialized comparison executor and the full VM agree record by
    /// record.
    #[test]
    fn fast_path_matches_vm(op in comparison_op(), c in -50i32..1000) {
        let (db, t) = make_db(true);
        let program = cmp_program(t, "price", op, TypedValue::Int32(c));
        let table = db.provider(t).unwrap();
        let procs = ProcedureRegistry::with_builtins();
        let ctx = EvalContext { table, tables: &db, procs: &procs };
        let mut fast = specialize(&program, table).unwrap();
        let is_comparison = matches!(fast, Executor::Comparison { .. });
        prop_assert!(is_comparison);
        let mut vm = Vm::new();
        for id in table.cursor() {
            let a = fast.run(&program, &ctx, id).unwrap();
            let b = vm.eval(&program, &ctx, id).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
