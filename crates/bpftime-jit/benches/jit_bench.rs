use bpftime_jit::{compile_with_default_backend, HelperTable};
use bpftime_sdk::Instruction;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn insn(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Instruction {
    Instruction { opcode, dst_reg: dst, src_reg: src, offset, imm }
}

fn immediate_return_program() -> Vec<Instruction> {
    vec![insn(0xb7, 0, 0, 0, 7), insn(0x95, 0, 0, 0, 0)]
}

/// A straight-line loop computing a running sum in r0, no branches.
fn straight_line_arith_program(steps: usize) -> Vec<Instruction> {
    let mut insns = Vec::with_capacity(steps + 1);
    for i in 0..steps {
        insns.push(insn(0x07, 0, 0, 0, i as i32)); // ADD64 r0, imm
    }
    insns.push(insn(0x95, 0, 0, 0, 0));
    insns
}

/// A loop with a backward conditional branch, decrementing r1 to zero.
fn branchy_program(iterations: i32) -> Vec<Instruction> {
    vec![
        insn(0xb7, 1, 0, 0, iterations), // MOV64 r1, iterations
        insn(0xb7, 0, 0, 0, 0),          // MOV64 r0, 0
        insn(0x07, 0, 0, 0, 1),          // ADD64 r0, 1   <- loop head (pc 2)
        insn(0x07, 1, 0, 0, -1),         // ADD64 r1, -1
        insn(0x15, 1, 0, 1, 0),          // JEQ r1, 0, +1 -> jumps to exit
        insn(0x05, 0, 0, -4, 0),         // else JA back to loop head
        insn(0x95, 0, 0, 0, 0),          // exit
    ]
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let helpers = HelperTable::new();

    group.bench_function("immediate_return", |b| {
        let insns = immediate_return_program();
        b.iter(|| compile_with_default_backend(black_box(&insns), &helpers).unwrap());
    });

    for steps in [8usize, 64, 512] {
        let insns = straight_line_arith_program(steps);
        group.bench_with_input(BenchmarkId::new("straight_line", steps), &insns, |b, insns| {
            b.iter(|| compile_with_default_backend(black_box(insns), &helpers).unwrap());
        });
    }

    group.bench_function("branchy_loop", |b| {
        let insns = branchy_program(10);
        b.iter(|| compile_with_default_backend(black_box(&insns), &helpers).unwrap());
    });

    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    let helpers = HelperTable::new();

    let program = compile_with_default_backend(&immediate_return_program(), &helpers).unwrap();
    group.bench_function("immediate_return", |b| {
        b.iter(|| unsafe { program.call(black_box(0), black_box(0)) });
    });

    let loop_program = compile_with_default_backend(&branchy_program(1000), &helpers).unwrap();
    group.bench_function("branchy_loop_1000", |b| {
        b.iter(|| unsafe { loop_program.call(black_box(0), black_box(0)) });
    });

    group.finish();
}

criterion_group!(benches, bench_compile, bench_execute);
criterion_main!(benches);
