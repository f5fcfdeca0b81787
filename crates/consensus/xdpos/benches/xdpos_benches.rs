//! Benchmarks for XDPoS consensus
//!
//! Run with: `cargo bench -p xdpos-consensus`

use alloy_primitives::{Address, B256, Bytes};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use xdpos_consensus::{
    BlockInfo, ExtraFieldsV2, QuorumCert, Signer,
    test_utils::test_signers,
    v2::{
        VoteForSign,
        proposer::select_proposer,
        types::vote_sig_hash,
        verification::{recover_signers, unique_signatures, verify_signers},
    },
};

fn block_info() -> BlockInfo {
    BlockInfo::new(B256::repeat_byte(0x11), 100, 1_000)
}

/// `count` masternodes and their votes on the same block
fn signed_votes(count: usize) -> (Vec<Address>, B256, Vec<Bytes>) {
    let signers = test_signers(count);
    let hash = vote_sig_hash(&VoteForSign { proposed_block_info: block_info(), gap_number: 450 });
    let signatures = signers.iter().map(|signer| signer.sign_hash(hash).unwrap()).collect();
    (signers.iter().map(Signer::address).collect(), hash, signatures)
}

/// Benchmark signer recovery of a QC with varying signature counts
fn bench_qc_signer_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("qc_signer_recovery");

    for sig_count in [4, 12, 18, 108] {
        let (_, hash, signatures) = signed_votes(sig_count);
        group.bench_with_input(BenchmarkId::from_parameter(sig_count), &sig_count, |b, _| {
            b.iter(|| black_box(recover_signers(black_box(&hash), black_box(&signatures))));
        });
    }

    group.finish();
}

/// Benchmark full QC signer checks against the masternode list
fn bench_qc_verify_signers(c: &mut Criterion) {
    let mut group = c.benchmark_group("qc_verify_signers");

    for masternodes in [18, 108] {
        let (addresses, hash, signatures) = signed_votes(masternodes);
        let threshold = signatures[..masternodes * 2 / 3 + 1].to_vec();
        group.bench_with_input(BenchmarkId::from_parameter(masternodes), &masternodes, |b, _| {
            b.iter(|| {
                let result = verify_signers(black_box(&hash), black_box(&threshold), &addresses);
                black_box(result)
            });
        });
    }

    group.finish();
}

/// Benchmark decoding the v2 extra field envelope
fn bench_extra_fields_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("extra_fields_decoding");

    for sig_count in [12, 73] {
        let (_, _, signatures) = signed_votes(sig_count);
        let qc = QuorumCert { proposed_block_info: block_info(), signatures, gap_number: 450 };
        let encoded = ExtraFieldsV2::new(101, qc).encode_to_vec();
        group.bench_with_input(BenchmarkId::from_parameter(sig_count), &encoded, |b, encoded| {
            b.iter(|| black_box(ExtraFieldsV2::decode_from_slice(black_box(encoded))));
        });
    }

    group.finish();
}

/// Benchmark the vote signature hash
fn bench_vote_sig_hash(c: &mut Criterion) {
    let vote = VoteForSign { proposed_block_info: block_info(), gap_number: 450 };
    c.bench_function("vote_sig_hash", |b| b.iter(|| black_box(vote_sig_hash(black_box(&vote)))));
}

/// Benchmark signature de-duplication with a share of repeats
fn bench_signature_deduplication(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_deduplication");

    for total_sigs in [20, 150] {
        let (_, _, mut signatures) = signed_votes(total_sigs / 2);
        signatures.extend_from_within(..);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{total_sigs}_sigs")),
            &total_sigs,
            |b, _| {
                b.iter(|| black_box(unique_signatures(black_box(&signatures))));
            },
        );
    }

    group.finish();
}

/// Benchmark leader selection
fn bench_proposer_selection(c: &mut Criterion) {
    let masternodes: Vec<Address> = (0..108).map(|i| Address::with_last_byte(i as u8)).collect();
    c.bench_function("select_proposer", |b| {
        let mut round = 0u64;
        b.iter(|| {
            round = round.wrapping_add(1);
            black_box(select_proposer(black_box(round), 900, &masternodes))
        });
    });
}

criterion_group!(
    benches,
    bench_qc_signer_recovery,
    bench_qc_verify_signers,
    bench_extra_fields_decoding,
    bench_vote_sig_hash,
    bench_signature_deduplication,
    bench_proposer_selection
);

criterion_main!(benches);
