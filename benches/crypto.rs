use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use zkdocs::crypto::{EncryptionEngine, Passphrase, RingProvider, MIN_KDF_ITERATIONS};

fn bench_kdf(c: &mut Criterion) {
    let engine = EncryptionEngine::new(Arc::new(RingProvider::new()), MIN_KDF_ITERATIONS);
    let passphrase = Passphrase::from("correct-horse-battery-staple");
    let salt = engine.kdf().generate_salt().unwrap();

    let mut group = c.benchmark_group("kdf");
    group.sample_size(10);
    for iterations in [MIN_KDF_ITERATIONS, 2 * MIN_KDF_ITERATIONS] {
        group.bench_with_input(
            BenchmarkId::new("pbkdf2_sha256", iterations),
            &iterations,
            |b, &iterations| {
                b.iter(|| {
                    let key = engine
                        .kdf()
                        .derive(&passphrase, &salt, iterations)
                        .unwrap();
                    black_box(key);
                })
            },
        );
    }
    group.finish();
}

fn bench_seal_open(c: &mut Criterion) {
    let engine = EncryptionEngine::new(Arc::new(RingProvider::new()), MIN_KDF_ITERATIONS);
    let passphrase = Passphrase::from("correct-horse-battery-staple");
    let salt = engine.kdf().generate_salt().unwrap();
    // Sealing with an already-derived key isolates AEAD cost from the KDF
    let key = engine
        .kdf()
        .derive(&passphrase, &salt, MIN_KDF_ITERATIONS)
        .unwrap();

    let mut group = c.benchmark_group("aead");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let plaintext = vec![0x5Au8; size];
        let payload = engine.seal_with_key(&plaintext, &key).unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("seal", size), &plaintext, |b, plaintext| {
            b.iter(|| black_box(engine.seal_with_key(plaintext, &key).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("open", size), &payload, |b, payload| {
            b.iter(|| black_box(engine.open_with_key(payload, &key).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_kdf, bench_seal_open);
criterion_main!(benches);
