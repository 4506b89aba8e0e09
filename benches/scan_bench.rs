use criterion::{black_box, criterion_group, criterion_main, Criterion};
use filterscan::*;

const N: i32 = 10_000;

fn populate(indexed: bool) -> (MemDatabase, TableId) {
    let mut db = MemDatabase::new();
    let t = db.create_table(
        TableSchema::builder("items")
            .key(DataKind::Text)
            .column("price", DataKind::Int32)
            .column("title", DataKind::Text)
            .build(),
    );
    let items = db.table_mut(t).unwrap();
    for i in 0..N {
        let id = items
            .insert(Some(TypedValue::Text(format!("item{}", i))))
            .unwrap();
        items.put(id, "price", TypedValue::Int32(i % 1000)).unwrap();
        let title = if i % 10 == 0 {
            format!("red widget {}", i)
        } else {
            format!("plain widget {}", i)
        };
        items.put(id, "title", TypedValue::Text(title)).unwrap();
    }
    if indexed {
        items.create_index("price", MemIndexKind::Value).unwrap();
        items.create_index("title", MemIndexKind::Text).unwrap();
    }
    (db, t)
}

fn range_program(t: TableId) -> Program {
    let mut b = ProgramBuilder::new(t);
    b.column("price");
    b.constant(TypedValue::Int32(50));
    b.op(Operator::Less, 2);
    b.finish().unwrap()
}

fn conjunction_program(t: TableId) -> Program {
    let mut b = ProgramBuilder::new(t);
    b.column("title");
    b.constant(TypedValue::Text("red".into()));
    b.op(Operator::Match, 2);
    b.column("price");
    b.constant(TypedValue::Int32(500));
    b.op(Operator::Less, 2);
    b.op(Operator::And, 2);
    b.finish().unwrap()
}

fn bench_select(c: &mut Criterion) {
    let procs = ProcedureRegistry::with_builtins();
    let config = ScanConfig::default();

    let (idx_db, idx_t) = populate(true);
    c.bench_function("select_range_indexed", |b| {
        b.iter(|| {
            let mut program = range_program(idx_t);
            let res = select(
                &idx_db,
                &procs,
                black_box(&mut program),
                None,
                Combinator::Or,
                &config,
            )
            .unwrap();
            black_box(res.len())
        })
    });

    let (seq_db, seq_t) = populate(false);
    c.bench_function("select_range_sequential", |b| {
        b.iter(|| {
            let mut program = range_program(seq_t);
            let res = select(
                &seq_db,
                &procs,
                black_box(&mut program),
                None,
                Combinator::Or,
                &config,
            )
            .unwrap();
            black_box(res.len())
        })
    });

    c.bench_function("select_conjunction_indexed", |b| {
        b.iter(|| {
            let mut program = conjunction_program(idx_t);
            let res = select(
                &idx_db,
                &procs,
                black_box(&mut program),
                None,
                Combinator::Or,
                &config,
            )
            .unwrap();
            black_box(res.len())
        })
    });
}

fn bench_per_record(c: &mut Criterion) {
    let procs = ProcedureRegistry::with_builtins();
    let (db, t) = populate(true);
    let table = db.provider(t).unwrap();
    let ctx = EvalContext {
        table,
        tables: &db,
        procs: &procs,
    };
    let program = range_program(t);

    c.bench_function("eval_vm", |b| {
        let mut vm = Vm::new();
        b.iter(|| {
            let mut hits = 0u32;
            for id in 1..=64u32 {
                if vm
                    .eval(&program, &ctx, black_box(id))
                    .unwrap()
                    .is_truthy()
                {
                    hits += 1;
                }
            }
            black_box(hits)
        })
    });

    c.bench_function("eval_fast_path", |b| {
        let mut ex = specialize(&program, table).unwrap();
        b.iter(|| {
            let mut hits = 0u32;
            for id in 1..=64u32 {
                if ex
                    .run(&program, &ctx, black_box(id))
                    .unwrap()
                    .is_truthy()
                {
                    hits += 1;
                }
            }
            black_box(hits)
        })
    });
}

criterion_group!(benches, bench_select, bench_per_record);
criterion_main!(benches);
