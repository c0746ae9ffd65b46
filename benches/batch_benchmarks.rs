//! Batch benchmarks: envelope parsing, and full dispatch of insert changesets.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::time::Duration;
use tablestore::batch::BatchTransactionParser;
use tablestore::protocol::{Headers, RequestContext, Resource};
use tablestore::{Config, TableHandler};

const PREFIX: &str = "http://127.0.0.1:10002/devstoreaccount1";
const CONTENT_TYPE: &str = "multipart/mixed; boundary=batch_bench";

fn insert_changeset(table: &str, partition: &str, start: u64, size: u64) -> String {
    let mut body = String::from(
        "--batch_bench\r\nContent-Type: multipart/mixed; boundary=changeset_bench\r\n\r\n",
    );
    for i in start..start + size {
        body.push_str("--changeset_bench\r\n");
        body.push_str("Content-Type: application/http\r\nContent-Transfer-Encoding: binary\r\n\r\n");
        body.push_str(&format!("POST {PREFIX}/{table} HTTP/1.1\r\n"));
        body.push_str("Accept: application/json;odata=nometadata\r\n");
        body.push_str("Prefer: return-no-content\r\n\r\n");
        body.push_str(&format!(
            r#"{{"PartitionKey":"{partition}","RowKey":"{i:010}","Amount":{i},"Label":"row {i}"}}"#
        ));
        body.push_str("\r\n");
    }
    body.push_str("--changeset_bench--\r\n\r\n--batch_bench--\r\n");
    body
}

fn make_bench_handler(table: &str) -> TableHandler {
    let handler = TableHandler::from_config(&Config::default());
    let body = format!(r#"{{"TableName":"{table}"}}"#);
    handler.handle("POST", &Resource::Tables, &ctx(), body.as_bytes());
    handler
}

fn ctx() -> RequestContext {
    RequestContext::new("devstoreaccount1", PREFIX)
        .with_headers([("Content-Type", CONTENT_TYPE)].into_iter().collect::<Headers>())
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_parse");
    let parser = BatchTransactionParser::new(CONTENT_TYPE).unwrap();
    for &size in &[1u64, 10, 100] {
        let body = insert_changeset("bench", "p", 0, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| parser.parse(black_box(body.as_bytes())));
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_dispatch");
    for &size in &[1u64, 10, 100] {
        let handler = make_bench_handler("bench");
        let ctx = ctx();
        let mut call_count = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &sz| {
            b.iter(|| {
                // fresh partition per call so inserts never collide
                call_count += 1;
                let body = insert_changeset("bench", &format!("p{call_count}"), 0, sz);
                handler.handle("POST", &Resource::Batch, &ctx, body.as_bytes())
            });
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(3));
    targets = bench_parse, bench_dispatch
}
criterion_main!(benches);
