use criterion::{black_box, criterion_group, criterion_main, Criterion};

use oralexam_core::error::Stage;
use oralexam_core::evaluator::{evaluate, extract_verdict_block, parse_verdict};
use oralexam_core::gateway::ModelResponse;
use oralexam_core::rubric::RubricSpec;
use oralexam_core::traits::TokenUsage;

const FENCED: &str = r#"The answer names the correct stage but misses the duration.

```json
{
  "score": "7/10",
  "flags": {"accuracy": true, "completeness": false, "reasoning": true},
  "corrections": "The first stage also has a latent and an active phase."
}
```
"#;

const BARE_OBJECT: &str = r#"Verdict: {"score": 10, "flags": [true, true, true], "corrections": ""} end"#;

fn long_reply() -> String {
    let mut s = String::new();
    for i in 0..40 {
        s.push_str(&format!("Paragraph {i} of commentary on the answer.\n\n```text\nnote {i}\n```\n"));
    }
    s.push_str(FENCED);
    s
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_verdict_block");
    let long = long_reply();

    group.bench_function("fenced", |b| {
        b.iter(|| extract_verdict_block(black_box(FENCED)))
    });
    group.bench_function("bare_object", |b| {
        b.iter(|| extract_verdict_block(black_box(BARE_OBJECT)))
    });
    group.bench_function("long", |b| {
        b.iter(|| extract_verdict_block(black_box(&long)))
    });

    group.finish();
}

fn bench_evaluate(c: &mut Criterion) {
    let rubric = RubricSpec::strict_default();
    let response = ModelResponse {
        stage: Stage::Grading,
        text: FENCED.to_string(),
        model: "bench".into(),
        usage: TokenUsage::default(),
        attempts: 1,
        latency_ms: 0,
    };

    c.bench_function("parse_verdict", |b| {
        b.iter(|| parse_verdict(black_box(FENCED)))
    });
    c.bench_function("evaluate", |b| {
        b.iter(|| evaluate(black_box(&response), &rubric))
    });
}

criterion_group!(benches, bench_extract, bench_evaluate);
criterion_main!(benches);
