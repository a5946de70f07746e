#![no_std]

const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: tagalloc::Allocator<HEAP_SIZE> = tagalloc::Allocator::new();

extern crate alloc;

#[test]
fn vec() {
    let mut v = alloc::vec![1, 2, 3];
    v.push(4);

    assert_eq!((1..=4).collect::<alloc::vec::Vec<_>>(), v);
}

#[test]
fn growing_vec_moves_through_many_blocks() {
    let mut v = alloc::vec::Vec::new();
    for i in 0..1000_u32 {
        v.push(i);
    }

    assert_eq!(v.len(), 1000);
    assert!(v.iter().enumerate().all(|(i, &x)| i as u32 == x));
    assert_eq!(ALLOCATOR.check(), Ok(()));
}

#[test]
fn map_and_formatting() {
    let mut map = alloc::collections::BTreeMap::new();
    map.insert("prologue", 8_usize);
    map.insert("epilogue", 0);
    map.insert("chunk", 4096);

    let summary = alloc::format!(
        "prologue: {}, epilogue: {}, chunk: {}",
        map["prologue"],
        map["epilogue"],
        map["chunk"]
    );
    assert_eq!(summary, "prologue: 8, epilogue: 0, chunk: 4096");
}

#[test]
fn interleaved_collections() {
    let mut strings = alloc::vec::Vec::new();
    let mut numbers = alloc::collections::VecDeque::new();
    for i in 0..100_usize {
        strings.push(alloc::format!("block {}", i));
        numbers.push_front(i);
    }
    strings.retain(|s| s.ends_with('7'));

    assert_eq!(strings.len(), 10);
    assert_eq!(numbers.iter().sum::<usize>(), 4950);
    assert_eq!(ALLOCATOR.check(), Ok(()));
}
