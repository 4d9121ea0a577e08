//! Benchmark: chain reservation over a fragmented global bitmap.

use cfs_alloc::{AllocBitmap, GroupSpec, bitmap_find_contiguous};
use cfs_types::{BlockNumber, BlockSize};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

/// Eight 3584-bit groups over four chains, every group ~95% used with
/// short free runs scattered through it.
fn make_bitmap() -> AllocBitmap {
    let bs = BlockSize::new(512).unwrap();
    let mut bm = AllocBitmap::new("global_bitmap", bs, 4096, 3584, 4, BlockNumber(6)).unwrap();
    for g in 0..8_u16 {
        bm.grow_chain(
            g % 4,
            GroupSpec {
                blkno: BlockNumber(u64::from(g) * 28_672 + 3),
                bits: 3584,
                reserved_prefix: 1,
            },
        )
        .unwrap();
    }
    while bm.reserve(64, None).is_ok() {}
    let mut bit = 100_u64;
    while bit + 16 < bm.valid_bits() {
        if let Some((gidx, _)) = bm.locate(bit) {
            let chain = bm.groups()[gidx].chain();
            let _ = bm.release(chain, bit, 16);
        }
        bit += 320;
    }
    bm
}

fn bench_reserve_release(c: &mut Criterion) {
    let base = make_bitmap();
    let mut group = c.benchmark_group("chain_reserve");

    group.bench_function("reserve_8_no_hint", |b| {
        b.iter_batched(
            || base.clone(),
            |mut bm| black_box(bm.reserve(black_box(8), None)),
            criterion::BatchSize::SmallInput,
        );
    });

    group.bench_function("reserve_8_with_hint", |b| {
        b.iter_batched(
            || base.clone(),
            |mut bm| black_box(bm.reserve(black_box(8), Some(black_box(20_000)))),
            criterion::BatchSize::SmallInput,
        );
    });

    group.bench_function("verify", |b| {
        b.iter(|| black_box(base.verify()));
    });

    group.finish();
}

fn bench_find_contiguous(c: &mut Criterion) {
    let base = make_bitmap();
    let bitmap = base.groups()[3].desc.bitmap.clone();

    c.bench_function("find_contiguous_16", |b| {
        b.iter(|| black_box(bitmap_find_contiguous(black_box(&bitmap), 3584, 16)));
    });
}

criterion_group!(benches, bench_reserve_release, bench_find_contiguous);
criterion_main!(benches);
