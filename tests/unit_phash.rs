// Unit tests for perceptual hashing and the list store.
//
// Exercises the file-backed path end to end: hashing a decoded image,
// looking it up in list files on disk, learning new hashes and seeing
// them on the next lookup, and the frame helpers the learner relies on.

use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};
use modgate::frames::{self, Frame};
use modgate::phash::{self, ListKind, MatchMode, PerceptualHash, PhashStore};

fn gradient() -> DynamicImage {
    let mut img = RgbImage::new(64, 64);
    for (x, y, px) in img.enumerate_pixels_mut() {
        *px = Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8]);
    }
    DynamicImage::ImageRgb8(img)
}

/// Flip the lowest `bits` bits of a 64-bit hash.
fn flip_low_bits(hash: &PerceptualHash, bits: u32) -> PerceptualHash {
    let value = u64::from_str_radix(hash.hex(), 16).unwrap();
    let mask = (1u64 << bits) - 1;
    PerceptualHash::from_hex(&format!("{:016x}", value ^ mask)).unwrap()
}

// ============================================================
// Hashing
// ============================================================

#[test]
fn hash_survives_lossless_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("g.png");
    gradient().save(&path).unwrap();

    let loaded = frames::load_frames(&path, 12).unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].phash(), &phash::compute(&gradient()));
}

#[test]
fn frame_memoizes_hash() {
    let frame = Frame::new(0, gradient());
    let a = frame.phash() as *const PerceptualHash;
    let b = frame.phash() as *const PerceptualHash;
    assert_eq!(a, b);
}

// ============================================================
// Store lookups against files on disk
// ============================================================

#[test]
fn exact_then_nearest_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("block.txt");
    let hash = phash::compute(&gradient());
    std::fs::write(&list, format!("# seeded\n{},meme\n", hash.hex())).unwrap();

    let store = PhashStore::new();
    let exact = store.lookup(&list, "not_ok", &hash, Some(4)).unwrap().unwrap();
    assert_eq!(exact.mode, MatchMode::Exact);
    assert_eq!(exact.label, "meme");

    let near = flip_low_bits(&hash, 3);
    let hit = store.lookup(&list, "not_ok", &near, Some(4)).unwrap().unwrap();
    assert_eq!(hit.mode, MatchMode::Nearest);
    assert_eq!(hit.distance, 3);

    let far = flip_low_bits(&hash, 5);
    assert!(store.lookup(&list, "not_ok", &far, Some(4)).unwrap().is_none());
    assert!(store.lookup(&list, "not_ok", &near, None).unwrap().is_none());
}

#[test]
fn missing_list_never_matches() {
    let store = PhashStore::new();
    let hash = phash::compute(&gradient());
    let missing = Path::new("/nonexistent/modgate/list.txt");
    assert!(store.lookup(missing, "ok", &hash, Some(4)).unwrap().is_none());
    assert_eq!(store.len(missing, "ok").unwrap(), 0);
}

// ============================================================
// Learning
// ============================================================

#[test]
fn learned_hash_is_visible_to_next_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("lists").join("allow.txt");
    let store = PhashStore::new();
    let hash = phash::compute(&gradient());

    assert!(store.lookup(&list, "ok", &hash, None).unwrap().is_none());
    assert!(store.append(&list, &hash, ListKind::Allow.default_label()).unwrap());

    let hit = store.lookup(&list, "ok", &hash, None).unwrap().unwrap();
    assert_eq!(hit.label, "ok");
    assert_eq!(store.len(&list, "ok").unwrap(), 1);
}

#[test]
fn appending_twice_writes_one_line() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("block.txt");
    std::fs::write(&list, "0000000000000000,old").unwrap();
    let store = PhashStore::new();
    let hash = phash::compute(&gradient());

    assert!(store.append(&list, &hash, "not_ok").unwrap());
    assert!(!store.append(&list, &hash, "not_ok").unwrap());

    let text = std::fs::read_to_string(&list).unwrap();
    assert_eq!(text, format!("0000000000000000,old\n{},not_ok\n", hash.hex()));
}

#[test]
fn first_and_last_picks_ends() {
    let frames: Vec<Frame> = (0..4).map(|i| Frame::new(i, gradient())).collect();
    let picked: Vec<usize> = frames::first_and_last(&frames).iter().map(|f| f.idx).collect();
    assert_eq!(picked, vec![0, 3]);

    let single = vec![Frame::new(0, gradient())];
    assert_eq!(frames::first_and_last(&single).len(), 1);
}

#[test]
fn sample_indices_include_both_ends() {
    assert_eq!(frames::sample_indices(10, 3), vec![0, 5, 9]);
    assert_eq!(frames::sample_indices(2, 12), vec![0, 1]);
    assert_eq!(frames::sample_indices(50, 1), vec![0]);
}
