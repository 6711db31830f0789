//! Insert throughput benchmarks.
//!
//! Measures:
//! - Placement cost on a growing chain
//! - Back-link patching into recent nodes
//! - Durability mode overhead

use anyhow::Result;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lattice_core::{
    CandidateBuilder, CandidateGraph, EntryPoint, IndexOptions, NeighborSlot, NeighborUpdate, NewNode,
    StoredNode, SyncMode, VectorIndex, level_multiplier, random_level,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::hint::black_box;
use tempfile::TempDir;

const DIMS: u32 = 128;

fn generate_vector(seed: u64) -> Vec<f32> {
    (0..DIMS).map(|i| ((seed + u64::from(i)) % 1000) as f32 / 1000.0).collect()
}

/// Links every new node to the most recent ones, like a search that always
/// finds the newest neighborhood.
struct RecentBuilder {
    recent: Mutex<Vec<StoredNode>>,
    rng: Mutex<StdRng>,
    m: u16,
    max_level: u8,
}

impl RecentBuilder {
    fn new(m: u16, max_level: u8) -> Self {
        Self { recent: Mutex::new(Vec::new()), rng: Mutex::new(StdRng::seed_from_u64(42)), m, max_level }
    }
}

impl CandidateBuilder for RecentBuilder {
    fn build_candidate_graph(&self, _vector: &[f32], _entry: Option<EntryPoint>) -> Result<CandidateGraph> {
        let level = random_level(level_multiplier(self.m), self.max_level, &mut *self.rng.lock());
        let recent = self.recent.lock();
        let targets: Vec<StoredNode> = recent.iter().rev().take(self.m as usize).copied().collect();

        let edges = targets.iter().map(|t| NeighborSlot::new(t.element, 1.0)).collect();
        let updates = targets
            .iter()
            .enumerate()
            .map(|(i, &target)| NeighborUpdate { target, level: 0, index: i, distance: 1.0 })
            .collect();

        Ok(CandidateGraph { node: NewNode { level, neighbors: vec![edges] }, updates, duplicate: None })
    }
}

fn bench_isolated_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("isolated_insert");
    group.throughput(Throughput::Elements(1));

    for sync in [SyncMode::Off, SyncMode::Normal] {
        group.bench_with_input(BenchmarkId::new("sync", format!("{sync:?}")), &sync, |b, &sync| {
            let temp_dir = TempDir::new().unwrap();
            let options = IndexOptions { sync, ..IndexOptions::default() };
            let index = VectorIndex::open(temp_dir.path().join("bench.lattice"), DIMS, options).unwrap();
            let builder = RecentBuilder::new(index.m(), 0);
            let mut seed = 0;

            b.iter(|| {
                seed += 1;
                black_box(index.insert(&generate_vector(seed), seed, &builder).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_linked_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("linked_insert");
    group.sample_size(50);

    let temp_dir = TempDir::new().unwrap();
    let options = IndexOptions { sync: SyncMode::Off, ..IndexOptions::default() };
    let index = VectorIndex::open(temp_dir.path().join("linked.lattice"), DIMS, options).unwrap();
    let builder = RecentBuilder::new(index.m(), index.max_level().min(4));
    let mut seed = 0;

    group.bench_function("with_back_links", |b| {
        b.iter(|| {
            seed += 1;
            let report = index.insert(&generate_vector(seed), seed, &builder).unwrap();
            if let Some(neighbors) = report.neighbors {
                let level = index.read_element(report.element).unwrap().level;
                builder.recent.lock().push(StoredNode { element: report.element, level, neighbors });
            }
            black_box(report);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_isolated_insert, bench_linked_insert);
criterion_main!(benches);
