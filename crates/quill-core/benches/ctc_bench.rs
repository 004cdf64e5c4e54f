use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quill_core::{CtcAligner, GreedyDecoder, Vocabulary};

fn synthetic_log_probs(steps: usize, classes: usize) -> Vec<Vec<f32>> {
    (0..steps)
        .map(|t| {
            let raw: Vec<f32> = (0..classes)
                .map(|k| (((t * 31 + k * 17) % 23) as f32) * 0.1)
                .collect();
            let z = raw.iter().map(|x| x.exp()).sum::<f32>().ln();
            raw.iter().map(|x| x - z).collect()
        })
        .collect()
}

fn bench_ctc(c: &mut Criterion) {
    let vocab = Vocabulary::default();
    let log_probs = synthetic_log_probs(32, vocab.num_classes());
    let label = vocab.encode("Hello, W0rld");
    let aligner = CtcAligner::new(vocab.blank());

    c.bench_function("ctc_align_t32_l12", |b| {
        b.iter(|| aligner.align(black_box(&log_probs), 32, label.as_slice()).unwrap());
    });

    let decoder = GreedyDecoder::new(Arc::new(vocab));
    c.bench_function("greedy_decode_t32", |b| {
        b.iter(|| decoder.decode_sequence(black_box(&log_probs)).unwrap());
    });
}

criterion_group!(benches, bench_ctc);
criterion_main!(benches);
