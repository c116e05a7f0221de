//! Benchmarks for dropbox destination resolution: rule matching sits on the
//! hot path of every `add-upload-request`, so a server configured with many
//! dropbox rules should still resolve destinations in well under a
//! millisecond.

use std::path::PathBuf;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dync_storage::{clean_filename, is_valid_barcode, DropboxConfig, DropboxRule};
use serde_json::json;

fn rules(n: usize) -> Vec<DropboxRule> {
    (0..n)
        .map(|i| DropboxRule {
            regexp: format!(r"^prefix{i}_.*\.raw$"),
            path: PathBuf::from("/tmp/dropbox"),
            origin: None,
            match_file: true,
            match_dir: false,
            requires_barcode: false,
        })
        .collect()
}

fn bench_resolve_dest_dir(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_dest_dir");

    for n in [1usize, 10, 100] {
        let mut dropboxes = rules(n);
        dropboxes.push(DropboxRule {
            regexp: r"^QJFDC010EU_.*\.raw$".to_string(),
            path: PathBuf::from("/tmp/dropbox"),
            origin: None,
            match_file: true,
            match_dir: false,
            requires_barcode: true,
        });
        let config = DropboxConfig {
            path: PathBuf::from("/tmp/dropbox"),
            manual: PathBuf::from("/tmp/dropbox"),
            dropboxes,
        };

        group.bench_function(format!("rules_{n}"), |b| {
            b.iter(|| {
                let dest = config.resolve_dest_dir(
                    black_box("client-a"),
                    black_box("QJFDC010EU_sample.raw"),
                    &json!({}),
                );
                black_box(dest)
            });
        });
    }

    group.finish();
}

fn bench_clean_filename(c: &mut Criterion) {
    c.bench_function("clean_filename", |b| {
        b.iter(|| black_box(clean_filename(black_box("weird (name) v2 [final].raw"))));
    });
}

fn bench_barcode_checksum(c: &mut Criterion) {
    c.bench_function("is_valid_barcode", |b| {
        b.iter(|| black_box(is_valid_barcode(black_box("QJFDC010EU"))));
    });
}

criterion_group!(
    benches,
    bench_resolve_dest_dir,
    bench_clean_filename,
    bench_barcode_checksum
);
criterion_main!(benches);
