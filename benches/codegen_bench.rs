// Benchmark for block code generation and linking
// Run with: cargo bench

use blocklink::blocks::{BlockGraph, BlockInstance, BlockKind};
use blocklink::codegen::generate;
use blocklink::linker::{compile, compile_json, link};
use criterion::{criterion_group, criterion_main, Criterion};

fn long_chain(len: usize) -> BlockGraph {
    let mut chain: Option<BlockInstance> = None;
    for i in (0..len).rev() {
        let mut block = BlockInstance::new(BlockKind::DisplayText)
            .with_literal("TEXT", format!("line {}", i).as_str())
            .with_literal("Y", (i % 240) as i64);
        block.next = chain.map(Box::new);
        chain = Some(block);
    }
    BlockGraph::new(chain.into_iter().collect())
}

fn nested_loops(depth: usize) -> BlockGraph {
    let mut block = BlockInstance::new(BlockKind::PlayTone).with_literal("DURATION", 50i64);
    for _ in 0..depth {
        block = BlockInstance::new(BlockKind::IfElse)
            .with_input("IF", BlockInstance::new(BlockKind::ShakeDetected))
            .with_input("DO", BlockInstance::new(BlockKind::RepeatTimes).with_input("DO", block));
    }
    BlockGraph::new(vec![block])
}

fn bench_generate(c: &mut Criterion) {
    let graph = long_chain(5_000);
    c.bench_function("generate 5k-block chain", |b| {
        b.iter(|| {
            let code = generate(&graph);
            assert_eq!(code.body.lines().count(), 5_000);
        });
    });

    let nested = nested_loops(20);
    c.bench_function("compile nested control flow", |b| {
        b.iter(|| compile(&nested));
    });
}

fn bench_link(c: &mut Criterion) {
    let code = generate(&long_chain(1_000));
    c.bench_function("link 1k statements", |b| {
        b.iter(|| link(&code).digest());
    });

    // Separate chains keep the document shallow.
    let flat = BlockGraph::new((0..1_000).map(|i| BlockInstance::new(BlockKind::WaitMs).with_literal("MS", i as i64)).collect());
    let json = flat.to_json().unwrap();
    c.bench_function("compile 1k-block JSON document", |b| {
        b.iter(|| compile_json(&json).unwrap());
    });
}

criterion_group!(benches, bench_generate, bench_link);
criterion_main!(benches);
