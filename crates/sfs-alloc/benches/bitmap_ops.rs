use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sfs_alloc::{bitmap_and_not, bitmap_count_free, bitmap_find_contiguous, bitmap_set};

fn bench_bitmap_ops(c: &mut Criterion) {
    // One block group worth of bits at 4K block size.
    let bits = 32768u32;
    let mut bitmap = vec![0u8; (bits / 8) as usize];
    for i in (0..bits).step_by(3) {
        bitmap_set(&mut bitmap, i);
    }
    let mask = vec![0x11u8; bitmap.len()];

    c.bench_function("count_free_group", |b| {
        b.iter(|| bitmap_count_free(black_box(&bitmap), bits));
    });

    c.bench_function("find_contiguous_8", |b| {
        b.iter(|| bitmap_find_contiguous(black_box(&bitmap), bits, 8));
    });

    c.bench_function("and_not_group", |b| {
        let mut dst = vec![0u8; bitmap.len()];
        b.iter(|| bitmap_and_not(black_box(&mut dst), &bitmap, &mask));
    });
}

criterion_group!(benches, bench_bitmap_ops);
criterion_main!(benches);
