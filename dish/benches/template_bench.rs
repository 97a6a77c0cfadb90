//! Benchmarks for template parsing and expansion.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dish::job::JobRecord;
use dish::template::Template;

const COMMAND: &str =
    "tophat -p 8 -r {inner_dist} -o tophat hg19 {fastq[0]} {fastq[1]} && samtools index {description}.bam";

fn job() -> JobRecord {
    JobRecord::new("SRR1234567")
        .with_field("inner_dist", 150)
        .with_field("fastq", vec!["SRR1234567_1.fastq", "SRR1234567_2.fastq"])
}

fn template_benchmark(c: &mut Criterion) {
    c.bench_function("parse", |b| b.iter(|| Template::parse(black_box(COMMAND))));

    let template = Template::parse(COMMAND).unwrap();
    let job = job();
    c.bench_function("expand", |b| b.iter(|| template.expand(black_box(&job))));
}

criterion_group!(benches, template_benchmark);
criterion_main!(benches);
