use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sqlite_interop::{
    default_library_file_name, platform_for, EmbeddedResources, MapConfig, NoResources, Resolver,
    Setting, SystemLoader,
};
use std::sync::Arc;

fn no_env(_: &str) -> Option<String> {
    None
}

fn disabled_search() -> MapConfig {
    MapConfig::new()
        .with(Setting::NoSearchDirectories, "1")
        .with(Setting::NoExtraction, "1")
        .with(Setting::ProcessorArchitecture, "x86_64")
}

/// Cached lookups after the first resolution
fn bench_resolve_cached(c: &mut Criterion) {
    let resolver = Resolver::new(
        Arc::new(disabled_search()),
        Arc::new(SystemLoader),
        Arc::new(NoResources),
    )
    .with_env(no_env);
    resolver.resolve();

    c.bench_function("resolve_cached", |b| {
        b.iter(|| black_box(resolver.resolve()));
    });
}

/// Full resolution with every fallback switched off
fn bench_resolve_cold(c: &mut Criterion) {
    let resolver = Resolver::new(
        Arc::new(disabled_search()),
        Arc::new(SystemLoader),
        Arc::new(NoResources),
    )
    .with_env(no_env);

    c.bench_function("resolve_cold", |b| {
        b.iter(|| {
            resolver.reset();
            black_box(resolver.resolve())
        });
    });
}

/// Extraction into a fresh cache directory each iteration
fn bench_extraction(c: &mut Criterion) {
    let payload = vec![0x5au8; 512 * 1024];
    let packaged: &'static [u8] =
        Box::leak(zstd::encode_all(&payload[..], 3).unwrap().into_boxed_slice());
    let file_name = default_library_file_name(std::mem::size_of::<usize>());
    let resources = Arc::new(
        EmbeddedResources::new().with(format!("x64/{}.zst", file_name), packaged),
    );

    c.bench_function("extract_512k", |b| {
        b.iter_with_setup(
            || tempfile::TempDir::new().unwrap(),
            |cache| {
                let config = disabled_search()
                    .with(Setting::NoExtraction, "0")
                    .with(Setting::CacheDirectory, cache.path().display().to_string());
                let resolver =
                    Resolver::new(Arc::new(config), Arc::new(SystemLoader), resources.clone())
                        .with_env(no_env);
                black_box(resolver.resolve());
            },
        );
    });
}

fn bench_platform_lookup(c: &mut Criterion) {
    c.bench_function("platform_for", |b| {
        b.iter(|| black_box(platform_for(black_box("AMD64"))));
    });
}

criterion_group!(
    benches,
    bench_resolve_cached,
    bench_resolve_cold,
    bench_extraction,
    bench_platform_lookup
);
criterion_main!(benches);
