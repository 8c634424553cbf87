use ggpk::codec::CodecId;
use ggpk::record::{SignatureRecord, Tag};
use ggpk::resolve::LINK_SENTINEL;
use ggpk::tree::Node;
use ggpk::writer::{ContainerWriter, EntryRef};
use ggpk::{
    compact, compact_to_path, pack_directory, verify, ByteSource, CompactOptions, ContentResolver,
    Error, ExtractOptions, ExtractStats, Extractor, Manifest, PackOptions, Tree, VerifyMode,
    VerifyOptions,
};
use std::fs;
use std::io::Cursor;
use std::path::Path;

type Writer = ContainerWriter<Cursor<Vec<u8>>>;

fn build<F>(f: F) -> Vec<u8>
where
    F: FnOnce(&mut Writer) -> EntryRef,
{
    let mut w = ContainerWriter::new(Cursor::new(Vec::new())).unwrap();
    let root = f(&mut w);
    w.finalize(&[root]).unwrap().into_inner()
}

fn parse(bytes: &[u8]) -> (Tree, ByteSource<Cursor<Vec<u8>>>) {
    let mut src = ByteSource::new(Cursor::new(bytes.to_vec())).unwrap();
    let tree = Tree::build(&mut src).unwrap();
    (tree, src)
}

fn collect_all() -> VerifyOptions {
    VerifyOptions { mode: VerifyMode::CollectAll }
}

fn mismatch_paths(bytes: &[u8]) -> Vec<String> {
    let (tree, mut src) = parse(bytes);
    verify(&tree, &mut src, collect_all()).unwrap()
        .mismatches.into_iter().map(|m| m.path).collect()
}

fn data_offset(tree: &Tree, path: &str) -> usize {
    tree.find(path).and_then(Node::as_file).unwrap().data.offset as usize
}

fn link(target: &str) -> Vec<u8> {
    let mut v = vec![LINK_SENTINEL];
    v.extend_from_slice(target.as_bytes());
    v
}

fn sample() -> Vec<u8> {
    build(|w| {
        let a = w.add_file("a.txt", b"hi").unwrap();
        let b = w.add_file("b.txt", b"bye").unwrap();
        w.add_directory("ROOT", &[a, b]).unwrap()
    })
}

fn extract_all(bytes: &[u8], dest: &Path) -> ggpk::Result<ExtractStats> {
    let (tree, mut src) = parse(bytes);
    let mut ex = Extractor::new(
        ContentResolver::new(&mut src, CodecId::Brotli),
        ExtractOptions { dest_dir: dest.to_path_buf(), recursive: true },
    );
    ex.extract(&tree, "/")?;
    ex.finish(&tree)
}

// ── Integrity ────────────────────────────────────────────────────────────────

#[test]
fn test_intact_container_verifies() {
    let (tree, mut src) = parse(&sample());
    let paths: Vec<&str> = tree.walk().map(Node::path).collect();
    assert_eq!(paths, ["/ROOT", "/a.txt", "/b.txt"]);

    let report = verify(&tree, &mut src, VerifyOptions::default()).unwrap();
    assert!(report.is_ok());
    assert_eq!((report.files_checked, report.dirs_checked, report.bytes_hashed), (2, 1, 5));
}

#[test]
fn test_corrupted_file_fails_file_and_root() {
    let mut bytes = sample();
    let (tree, _) = parse(&bytes);
    let at = data_offset(&tree, "/b.txt");
    bytes[at..at + 3].copy_from_slice(b"byz");

    assert_eq!(mismatch_paths(&bytes), ["/b.txt", "/ROOT"]);

    let (tree, mut src) = parse(&bytes);
    let report = verify(&tree, &mut src, VerifyOptions::default()).unwrap();
    assert_eq!(report.mismatches.len(), 1);
    match report.into_result() {
        Err(Error::DigestMismatch { path, expected, actual }) => {
            assert_eq!(path, "/b.txt");
            assert_ne!(expected, actual);
        }
        other => panic!("expected DigestMismatch, got {other:?}"),
    }
}

#[test]
fn test_single_byte_flip_reaches_every_ancestor() {
    let mut bytes = build(|w| {
        let x = w.add_file("x.bin", &[0x55; 64]).unwrap();
        let other = w.add_file("y.bin", b"untouched").unwrap();
        let tex = w.add_directory("tex", &[x]).unwrap();
        let art = w.add_directory("art", &[tex, other]).unwrap();
        w.add_directory("ROOT", &[art]).unwrap()
    });
    let (tree, _) = parse(&bytes);
    let at = data_offset(&tree, "/art/tex/x.bin") + 17;
    bytes[at] ^= 0x01;

    assert_eq!(mismatch_paths(&bytes), ["/art/tex/x.bin", "/art/tex", "/art", "/ROOT"]);
}

#[test]
fn test_swapping_entries_breaks_only_the_directory() {
    let mut bytes = sample();
    let (tree, _) = parse(&bytes);
    let root_at = tree.root_dir().unwrap().offset as usize;
    // header, name_units, count, digest, "ROOT\0" as UTF-16
    let entries = root_at + 8 + 4 + 4 + 32 + 10;
    let (first, second) = bytes[entries..entries + 24].split_at(12);
    let swapped = [second, first].concat();
    bytes[entries..entries + 24].copy_from_slice(&swapped);

    let (tree, _) = parse(&bytes);
    let order: Vec<&str> = tree.walk().map(Node::path).collect();
    assert_eq!(order, ["/ROOT", "/b.txt", "/a.txt"]);
    assert_eq!(mismatch_paths(&bytes), ["/ROOT"]);
}

#[test]
fn test_free_space_is_skipped() {
    let bytes = build(|w| {
        let gap = w.add_free(100).unwrap();
        let a = w.add_file("a.txt", b"hi").unwrap();
        w.add_directory("ROOT", &[gap, a]).unwrap()
    });
    let (tree, mut src) = parse(&bytes);
    assert_eq!(tree.stats().files, 1);
    assert!(verify(&tree, &mut src, VerifyOptions::default()).unwrap().is_ok());
}

/// `depth` nested `d` directories beside `/top.txt`, optionally with
/// `bottom.bin` in the innermost one.
fn deep_chain(depth: usize, bottom: bool) -> Vec<u8> {
    build(|w| {
        let inner: Vec<EntryRef> = if bottom {
            vec![w.add_file("bottom.bin", &[0x33; 16]).unwrap()]
        } else {
            Vec::new()
        };
        let mut dir = w.add_directory("d", &inner).unwrap();
        for _ in 1..depth {
            dir = w.add_directory("d", &[dir]).unwrap();
        }
        let top = w.add_file("top.txt", b"top").unwrap();
        w.add_directory("", &[top, dir]).unwrap()
    })
}

#[test]
fn test_deep_chain_verifies_compacts_and_extracts() {
    let depth = 4000;
    let mut bytes = deep_chain(depth, true);
    let (tree, mut src) = parse(&bytes);
    let report = verify(&tree, &mut src, VerifyOptions::default()).unwrap();
    assert!(report.is_ok());
    assert_eq!(report.dirs_checked, depth + 1);

    let compacted = compact_bytes(&bytes);
    let (again, mut again_src) = parse(&compacted);
    assert!(verify(&again, &mut again_src, VerifyOptions::default()).unwrap().is_ok());
    assert_eq!(again.stats(), tree.stats());

    let bottom = tree.walk().find(|n| n.name() == "bottom.bin").unwrap();
    let at = bottom.as_file().unwrap().data.offset as usize;
    bytes[at] ^= 0x01;
    let mismatches = mismatch_paths(&bytes);
    assert_eq!(mismatches.len(), depth + 2);
    assert!(mismatches[0].ends_with("/d/bottom.bin"));
    assert_eq!(mismatches.last().map(String::as_str), Some("/"));
    drop(again);
    drop(tree);

    // Innermost file left out so extracted paths stay within OS limits.
    let dest = tempfile::tempdir().unwrap();
    let stats = extract_all(&deep_chain(depth, false), dest.path()).unwrap();
    assert_eq!(stats.files_written, 1);
    assert_eq!(fs::read(dest.path().join("top.txt")).unwrap(), b"top");
}

#[test]
fn test_child_shadowing_its_root_is_rejected() {
    let bytes = build(|w| {
        let a = w.add_file("a.txt", b"inner").unwrap();
        let shadow = w.add_directory("ROOT", &[a]).unwrap();
        w.add_directory("ROOT", &[shadow]).unwrap()
    });
    let mut src = ByteSource::new(Cursor::new(bytes)).unwrap();
    assert!(matches!(Tree::build(&mut src), Err(Error::MalformedRecord { .. })));
}

// ── Compaction ───────────────────────────────────────────────────────────────

fn compact_bytes(bytes: &[u8]) -> Vec<u8> {
    let (tree, mut src) = parse(bytes);
    let mut out = Vec::new();
    compact(&tree, &mut src, &mut out, &CompactOptions::default()).unwrap();
    out
}

fn logical_view(bytes: &[u8]) -> Vec<(String, String, u32, Option<u64>)> {
    let (tree, _) = parse(bytes);
    Manifest::from_tree(&tree).entries.into_iter()
        .map(|e| (e.path, e.digest, e.key, e.size))
        .collect()
}

fn fragmented() -> Vec<u8> {
    build(|w| {
        w.add_free(4096).unwrap();
        let a = w.add_file("a.txt", b"hi").unwrap();
        w.add_free(333).unwrap();
        let b = w.add_file("b.dds", b"DDS pixels").unwrap();
        let tex = w.add_directory("tex", &[b]).unwrap();
        let gap = w.add_free(12).unwrap();
        w.add_directory("ROOT", &[a, gap, tex]).unwrap()
    })
}

#[test]
fn test_compaction_preserves_logical_tree() {
    let before = fragmented();
    let after = compact_bytes(&before);

    assert!(after.len() < before.len());
    assert_eq!(logical_view(&before), logical_view(&after));

    let (tree, mut src) = parse(&after);
    assert!(verify(&tree, &mut src, VerifyOptions::default()).unwrap().is_ok());

    // Signature, then directories, then files.
    let offsets: Vec<(Tag, u64)> = tree.walk().map(|n| match n {
        Node::Directory(d) => (Tag::Directory, d.offset),
        Node::File(f)      => (Tag::File, f.offset),
    }).collect();
    let first_file = offsets.iter().filter(|(t, _)| *t == Tag::File).map(|(_, o)| *o).min().unwrap();
    let last_dir = offsets.iter().filter(|(t, _)| *t == Tag::Directory).map(|(_, o)| *o).max().unwrap();
    assert!(last_dir < first_file);
    assert_eq!(tree.root_dir().unwrap().offset, SignatureRecord::encoded_len(1));
}

#[test]
fn test_compaction_is_idempotent() {
    let once = compact_bytes(&fragmented());
    let twice = compact_bytes(&once);
    assert_eq!(once, twice);
}

#[test]
fn test_compact_to_path_publishes_complete_output() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("in.ggpk");
    let dest = dir.path().join("result.ggpk");
    fs::write(&src_path, fragmented()).unwrap();

    let mut src = ByteSource::open(&src_path).unwrap();
    let tree = Tree::build(&mut src).unwrap();
    let stats = compact_to_path(&tree, &mut src, &dest, &CompactOptions { buffer_size: 64 }).unwrap();

    let written = fs::read(&dest).unwrap();
    assert_eq!(stats.bytes_written, written.len() as u64);
    assert_eq!((stats.directories, stats.files), (2, 2));
    assert_eq!(written, compact_bytes(&fragmented()));
}

#[test]
fn test_failed_compaction_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("result.ggpk");
    let bytes = sample();
    let (tree, _) = parse(&bytes);

    // Cut the stream one byte into the content of /b.txt.
    let cut = data_offset(&tree, "/b.txt") + 2;
    let mut short = ByteSource::new(Cursor::new(bytes[..cut].to_vec())).unwrap();
    let err = compact_to_path(&tree, &mut short, &dest, &CompactOptions::default()).unwrap_err();
    assert!(matches!(err, Error::TruncatedRecord { .. }), "{err:?}");

    assert!(!dest.exists());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

// ── Content resolution & extraction ──────────────────────────────────────────

fn link_pair(link_first: bool) -> Vec<u8> {
    build(|w| {
        let a = w.add_file("a.dds", &link("/tex/b.dds")).unwrap();
        let b = w.add_file("b.dds", b"DDS pixels").unwrap();
        let tex = w.add_directory("tex", &[b]).unwrap();
        let children = if link_first { [a, tex] } else { [tex, a] };
        w.add_directory("", &children).unwrap()
    })
}

#[test]
fn test_links_resolve_in_either_order() {
    for link_first in [true, false] {
        let dest = tempfile::tempdir().unwrap();
        let stats = extract_all(&link_pair(link_first), dest.path()).unwrap();

        assert_eq!(fs::read(dest.path().join("a.dds")).unwrap(), b"DDS pixels");
        assert_eq!(fs::read(dest.path().join("tex").join("b.dds")).unwrap(), b"DDS pixels");
        assert_eq!(stats, ExtractStats { files_written: 2, links_resolved: 1, bytes_written: 20 });
    }
}

#[test]
fn test_link_chain_resolves_transitively() {
    let bytes = build(|w| {
        let a = w.add_file("a.dds", &link("/b.dds")).unwrap();
        let b = w.add_file("b.dds", &link("/c.dds")).unwrap();
        let c = w.add_file("c.dds", b"DDS chain").unwrap();
        w.add_directory("", &[a, b, c]).unwrap()
    });
    let dest = tempfile::tempdir().unwrap();
    let stats = extract_all(&bytes, dest.path()).unwrap();
    for name in ["a.dds", "b.dds", "c.dds"] {
        assert_eq!(fs::read(dest.path().join(name)).unwrap(), b"DDS chain", "{name}");
    }
    assert_eq!(stats.links_resolved, 2);
}

#[test]
fn test_link_target_outside_scope_is_read_on_finish() {
    let bytes = link_pair(true);
    let (tree, mut src) = parse(&bytes);
    let dest = tempfile::tempdir().unwrap();

    let mut ex = Extractor::new(
        ContentResolver::new(&mut src, CodecId::Brotli),
        ExtractOptions { dest_dir: dest.path().to_path_buf(), recursive: false },
    );
    ex.extract(&tree, "/a.dds").unwrap();
    assert_eq!(ex.pending_links(), 1);
    ex.finish(&tree).unwrap();

    assert_eq!(fs::read(dest.path().join("a.dds")).unwrap(), b"DDS pixels");
    assert!(!dest.path().join("tex").exists());
}

#[test]
fn test_missing_link_target_is_broken() {
    let bytes = build(|w| {
        let a = w.add_file("a.dds", &link("/missing.dds")).unwrap();
        w.add_directory("", &[a]).unwrap()
    });
    let dest = tempfile::tempdir().unwrap();
    match extract_all(&bytes, dest.path()) {
        Err(Error::BrokenLink { target, dependents }) => {
            assert_eq!(target, "/missing.dds");
            assert_eq!(dependents, ["/a.dds"]);
        }
        other => panic!("expected BrokenLink, got {other:?}"),
    }
}

#[test]
fn test_undecodable_texture_is_unsupported() {
    let bytes = build(|w| {
        let x = w.add_file("x.dds", &[0x01, 0x02]).unwrap();
        w.add_directory("", &[x]).unwrap()
    });
    let dest = tempfile::tempdir().unwrap();
    assert!(matches!(
        extract_all(&bytes, dest.path()),
        Err(Error::UnsupportedEncoding { path, .. }) if path == "/x.dds"
    ));
}

#[test]
fn test_non_recursive_extract_skips_subdirectories() {
    let bytes = build(|w| {
        let deep = w.add_file("deep.txt", b"deep").unwrap();
        let sub = w.add_directory("sub", &[deep]).unwrap();
        let top = w.add_file("top.txt", b"top").unwrap();
        w.add_directory("", &[sub, top]).unwrap()
    });
    let (tree, mut src) = parse(&bytes);
    let dest = tempfile::tempdir().unwrap();
    let mut ex = Extractor::new(
        ContentResolver::new(&mut src, CodecId::Brotli),
        ExtractOptions { dest_dir: dest.path().to_path_buf(), recursive: false },
    );
    ex.extract(&tree, "/").unwrap();
    let stats = ex.finish(&tree).unwrap();

    assert_eq!(stats.files_written, 1);
    assert!(dest.path().join("top.txt").exists());
    assert!(!dest.path().join("sub").exists());
}

// ── Packing ──────────────────────────────────────────────────────────────────

#[test]
fn test_pack_compressed_then_extract_roundtrip() {
    let input = tempfile::tempdir().unwrap();
    let payload = b"Compressible payload. ".repeat(200);
    fs::create_dir(input.path().join("Art")).unwrap();
    fs::write(input.path().join("Art").join("notes.txt"), &payload).unwrap();
    fs::write(input.path().join("Art").join("t.dds"), b"DDS raw texture").unwrap();
    fs::write(input.path().join("readme.txt"), b"hello").unwrap();

    let out = tempfile::tempdir().unwrap();
    let container = out.path().join("packed.ggpk");
    let stats = pack_directory(
        input.path(),
        &container,
        &PackOptions { codec: Some(CodecId::Brotli), level: 9 },
    ).unwrap();
    assert_eq!((stats.directories, stats.files), (2, 3));

    let bytes = fs::read(&container).unwrap();
    let (tree, mut src) = parse(&bytes);
    assert!(verify(&tree, &mut src, VerifyOptions::default()).unwrap().is_ok());

    let paths: Vec<&str> = tree.walk().map(Node::path).collect();
    assert_eq!(paths, ["/", "/Art", "/Art/notes.txt", "/Art/t.dds", "/readme.txt"]);
    let stored = tree.find("/Art/notes.txt").and_then(Node::as_file).unwrap().size();
    assert!(stored < payload.len() as u64);

    let dest = tempfile::tempdir().unwrap();
    extract_all(&bytes, dest.path()).unwrap();
    assert_eq!(fs::read(dest.path().join("Art").join("notes.txt")).unwrap(), payload);
    assert_eq!(fs::read(dest.path().join("Art").join("t.dds")).unwrap(), b"DDS raw texture");
    assert_eq!(fs::read(dest.path().join("readme.txt")).unwrap(), b"hello");
}
