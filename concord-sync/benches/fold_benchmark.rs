use criterion::{black_box, criterion_group, criterion_main, Criterion};
use concord_sync::storage::journal::decode_frames;
use concord_sync::storage::JournalEntry;
use concord_sync::{Document, Patch, PatchId, PatchLog, StringDocument, StringOptions, TextPatch};
use serde_json::json;

/// A history of `count` appended lines, optionally with a snapshot every
/// `snapshot_every` patches.
fn history(count: u64, snapshot_every: Option<u64>) -> PatchLog<TextPatch> {
    let mut log = PatchLog::new();
    let mut current = StringDocument::default();
    for i in 0..count {
        let next = StringDocument::new(format!("{}line {i}\n", current.as_str()));
        let snapshot = snapshot_every
            .filter(|every| (i + 1) % every == 0)
            .map(|_| next.to_str());
        log.insert(Patch {
            id: PatchId::new(i + 1, (i % 3) as u32),
            patch: current.make_patch(&next),
            snapshot,
        });
        current = next;
    }
    log
}

fn bench_make_patch(c: &mut Criterion) {
    let base = StringDocument::new("the quick brown fox jumps over the lazy dog\n".repeat(50));
    let edited = StringDocument::new(base.as_str().replacen("lazy", "sleepy", 10));

    c.bench_function("make_patch_2KB", |b| {
        b.iter(|| black_box(base.make_patch(black_box(&edited))))
    });
}

fn bench_fold_full_history(c: &mut Criterion) {
    let log = history(500, None);

    c.bench_function("fold_500_patches", |b| {
        b.iter(|| {
            let doc: StringDocument = log.content(&StringOptions {}, None).unwrap();
            black_box(doc)
        })
    });
}

fn bench_fold_from_snapshot(c: &mut Criterion) {
    let log = history(500, Some(100));

    c.bench_function("fold_500_patches_snapshot_100", |b| {
        b.iter(|| {
            let doc: StringDocument = log.content(&StringOptions {}, None).unwrap();
            black_box(doc)
        })
    });
}

fn bench_journal_replay(c: &mut Criterion) {
    let mut bytes = Vec::new();
    for i in 0..1_000u64 {
        let row = json!({"string_id": "s", "time": i, "user_id": 0, "patch": [{"start": i, "insert": "x"}]});
        let entry = JournalEntry::upsert(i, "patches", row.as_object().unwrap()).unwrap();
        bytes.extend(entry.encode().unwrap());
    }

    c.bench_function("journal_replay_1K_entries", |b| {
        b.iter(|| black_box(decode_frames(black_box(&bytes))))
    });
}

criterion_group!(
    benches,
    bench_make_patch,
    bench_fold_full_history,
    bench_fold_from_snapshot,
    bench_journal_replay,
);
criterion_main!(benches);
