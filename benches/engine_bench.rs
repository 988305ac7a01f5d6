// ── Canopy Core: Benchmarks ────────────────────────────────────────────────
// Hot paths that run per-chunk or per-layer during ingestion: splitting,
// clustering, TF-IDF keyword ranking.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use canopy_core::engine::tree::clustering::{perform_clustering, ClusteringParams};
use canopy_core::engine::tree::keywords::tfidf_keywords;
use canopy_core::{SplitterConfig, TextSplitter, Tokenizer};

fn sample_document() -> String {
    let paragraphs = [
        "Kafka back-pressure appears when consumers cannot keep up with broker throughput. \
         Scale the consumer group and tune fetch sizes to relieve it.",
        "Postgres vacuum reclaims dead tuples and prevents transaction id wraparound. \
         Autovacuum thresholds matter for high-churn tables.",
        "The deployment pipeline promotes builds through staging before production. \
         Rollbacks use the previous image tag and take about two minutes.",
    ];
    paragraphs.join(" ").repeat(40)
}

fn bench_splitter(c: &mut Criterion) {
    let doc = sample_document();
    let splitter =
        TextSplitter::new(SplitterConfig { max_tokens: 200, ..Default::default() }, Tokenizer::heuristic());
    c.bench_function("split_fixed_200tok", |b| {
        b.iter(|| black_box(splitter.split_fixed(black_box(&doc))))
    });

    let markdown = format!("# Runbook\n{}\n## Rollback\n{}", doc, doc);
    c.bench_function("split_markdown_200tok", |b| {
        b.iter(|| black_box(splitter.split_markdown(black_box(&markdown))))
    });
}

fn bench_clustering(c: &mut Criterion) {
    // Three synthetic topic blobs in 32 dims.
    let nodes: Vec<(u64, Vec<f32>)> = (0..90u64)
        .map(|i| {
            let blob = (i % 3) as usize;
            let mut v = vec![0.1f32; 32];
            for d in 0..10 {
                v[blob * 10 + d] = 1.0 + (i as f32) * 0.001;
            }
            (i, v)
        })
        .collect();
    let params = ClusteringParams::default();
    c.bench_function("cluster_90x32", |b| {
        b.iter(|| black_box(perform_clustering(black_box(&nodes), 8, &params)))
    });
}

fn bench_tfidf(c: &mut Criterion) {
    let doc = sample_document();
    let corpus: Vec<String> = (0..8).map(|i| format!("{} variant {}", sample_document(), i)).collect();
    c.bench_function("tfidf_keywords_8doc_corpus", |b| {
        b.iter(|| black_box(tfidf_keywords(black_box(&doc), Some(&corpus), 24)))
    });
}

criterion_group!(benches, bench_splitter, bench_clustering, bench_tfidf);
criterion_main!(benches);
