use criterion::{Criterion, black_box, criterion_group, criterion_main};
use model_fixtures::encoding::{InputDensity, build_encodings, feature_columns};
use model_fixtures::estimator::Architecture;
use model_fixtures::input_fn::InputFnPair;
use model_fixtures::roles::{LabelKind, RoleSpec, Task, classify};
use model_fixtures::table::{Column, Table};

const CATEGORIES: [&str; 6] = ["Service", "Professional", "Executive", "Clerical", "Repair", "Sales"];

fn make_table(rows: usize) -> Table {
    Table::from_columns(vec![
        (
            "age".to_string(),
            Column::Int((0..rows).map(|i| 18 + (i % 60) as i64).collect()),
        ),
        (
            "income".to_string(),
            Column::Float((0..rows).map(|i| 1000.0 + (i * 37 % 9000) as f64).collect()),
        ),
        (
            "occupation".to_string(),
            Column::Str(
                (0..rows)
                    .map(|i| CATEGORIES[i * 7 % CATEGORIES.len()].to_string())
                    .collect(),
            ),
        ),
        (
            "label".to_string(),
            Column::Int((0..rows).map(|i| (i % 2) as i64).collect()),
        ),
    ])
    .expect("table")
}

fn role_spec() -> RoleSpec {
    RoleSpec {
        continuous: vec!["age".into(), "income".into()],
        categorical: vec!["occupation".into()],
        label: "label".into(),
        label_kind: LabelKind::Classes {
            vocabulary: vec!["0".into(), "1".into()],
        },
    }
}

fn bench_pipeline(c: &mut Criterion) {
    let rows = 10_000;
    let raw = make_table(rows);

    c.bench_function("classify+encode n=10000", |bch| {
        bch.iter(|| {
            let mut table = raw.clone();
            let roles = classify(&mut table, black_box(&role_spec())).expect("classify");
            build_encodings(&table, &roles).expect("encode")
        })
    });

    let mut table = raw.clone();
    let roles = classify(&mut table, &role_spec()).expect("classify");
    let encodings = build_encodings(&table, &roles).expect("encode");
    let pair = InputFnPair::new(table, roles).expect("pair");

    c.bench_function("training input_fn n=10000", |bch| {
        bch.iter(|| pair.training().invoke().expect("invoke"))
    });

    c.bench_function("one-hot columns n=10000", |bch| {
        bch.iter(|| feature_columns(black_box(&encodings), InputDensity::Dense))
    });

    c.bench_function("linear fit 10 steps n=10000", |bch| {
        bch.iter(|| {
            let mut model = Architecture::Linear
                .build(Task::Classification { n_classes: 2 }, &encodings, &[], 0)
                .expect("build");
            model.fit(pair.training(), 10).expect("fit");
        })
    });
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
