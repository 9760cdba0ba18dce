use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shard_cache::cache::index::{EntryKind, HashIndex, HashNode, KEY_OFFSET};
use shard_cache::cache::list::ListNode;
use shard_cache::memory::Accountant;
use std::ptr::NonNull;

#[repr(C)]
struct Entry {
    hash_node: HashNode,
    key: [u8; 256],
}

const _: () = assert!(std::mem::offset_of!(Entry, key) == KEY_OFFSET);

fn entry(i: u32) -> Box<Entry> {
    let mut e = Box::new(Entry {
        hash_node: HashNode {
            link: ListNode::new(),
            kind: EntryKind::Record,
        },
        key: [0; 256],
    });
    let text = format!("bench-key-{i:06}");
    e.key[0] = text.len() as u8;
    e.key[1..1 + text.len()].copy_from_slice(text.as_bytes());
    e
}

fn bench_index_churn(c: &mut Criterion) {
    c.bench_function("index_insert_get_remove_4096", |b| {
        let mut entries: Vec<Box<Entry>> = (0..4096).map(entry).collect();
        b.iter(|| {
            let mut mem = Accountant::new(1024);
            let mut index = HashIndex::new(&mut mem).unwrap();
            unsafe {
                for e in entries.iter_mut() {
                    if index.insert(NonNull::from(&mut e.hash_node), &mut mem) > 0 {
                        index.grow(&mut mem);
                    }
                }
                for e in entries.iter_mut() {
                    black_box(index.get(e.key.as_ptr()));
                }
                for e in entries.iter_mut() {
                    if index.remove(NonNull::from(&mut e.hash_node), &mut mem) > 0 {
                        index.shrink(&mut mem);
                    }
                }
            }
        });
    });
}

criterion_group!(benches, bench_index_churn);
criterion_main!(benches);
