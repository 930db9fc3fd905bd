//! Benchmark: SHA-256 over one 4K block vs node-block encode + hash.
//!
//! The checker hashes every block it reads and the initializer hashes every
//! block it writes, so this path dominates tree verification cost.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tresor_types::{sha256_4k_hash, Block, Generation, Pba, Type1NodeBlock};

fn make_node_block() -> Type1NodeBlock {
    let mut node_block = Type1NodeBlock::ZERO;
    for (idx, node) in node_block.nodes.iter_mut().enumerate() {
        node.pba = Pba(idx as u64 + 128);
        node.gen = Generation(3);
        node.hash.0[0] = idx as u8;
    }
    node_block
}

fn bench_hash_raw_block(c: &mut Criterion) {
    let mut block = Block::ZERO;
    for (idx, byte) in block.as_bytes_mut().iter_mut().enumerate() {
        *byte = idx as u8;
    }

    c.bench_function("sha256_4k_hash", |b| {
        b.iter(|| black_box(sha256_4k_hash(black_box(&block))));
    });
}

fn bench_encode_and_hash(c: &mut Criterion) {
    let node_block = make_node_block();

    c.bench_function("encode_then_hash", |b| {
        b.iter(|| {
            let block = black_box(&node_block).to_block();
            black_box(sha256_4k_hash(&block))
        });
    });
}

criterion_group!(benches, bench_hash_raw_block, bench_encode_and_hash);
criterion_main!(benches);
