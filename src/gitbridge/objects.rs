//! In-memory synthesis of git objects and pack files.
//!
//! Everything here is pure: bytes in, hashed objects and pack bytes out. No
//! repository ever touches disk; large content is represented by LFS
//! pointers upstream, so packs stay small.

use std::collections::BTreeMap;
use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
}

impl ObjectKind {
    #[must_use]
    pub fn header_name(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
        }
    }

    /// Pack entry type code.
    #[must_use]
    pub fn pack_type(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
        }
    }
}

/// A hashed git object: kind, SHA-1 (hex), and the raw (unframed) content.
#[derive(Debug, Clone)]
pub struct GitObject {
    pub kind: ObjectKind,
    pub sha1: String,
    pub content: Vec<u8>,
}

fn hash_object(kind: ObjectKind, content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", kind.header_name(), content.len()).as_bytes());
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn create_blob_object(content: &[u8]) -> GitObject {
    GitObject {
        kind: ObjectKind::Blob,
        sha1: hash_object(ObjectKind::Blob, content),
        content: content.to_vec(),
    }
}

/// Git LFS pointer file content for an oid.
#[must_use]
pub fn create_lfs_pointer(sha256: &str, size: i64) -> Vec<u8> {
    format!("version https://git-lfs.github.com/spec/v1\noid sha256:{sha256}\nsize {size}\n")
        .into_bytes()
}

/// Git sorts tree entries as raw bytes, with directory names compared as if
/// they carried a trailing '/'.
fn tree_sort_key(name: &str, is_tree: bool) -> Vec<u8> {
    let mut key = name.as_bytes().to_vec();
    if is_tree {
        key.push(b'/');
    }
    key
}

fn create_tree_object(entries: &[(String, String, String)]) -> GitObject {
    // entries: (mode, name, sha1_hex); mode "40000" marks a subtree.
    let mut sorted: Vec<&(String, String, String)> = entries.iter().collect();
    sorted.sort_by(|a, b| tree_sort_key(&a.1, a.0 == "40000").cmp(&tree_sort_key(&b.1, b.0 == "40000")));

    let mut content = Vec::new();
    for (mode, name, sha1_hex) in sorted {
        content.extend_from_slice(mode.as_bytes());
        content.push(b' ');
        content.extend_from_slice(name.as_bytes());
        content.push(0);
        content.extend_from_slice(&hex::decode(sha1_hex).unwrap_or_default());
    }

    GitObject {
        kind: ObjectKind::Tree,
        sha1: hash_object(ObjectKind::Tree, &content),
        content,
    }
}

/// Build nested trees from flat `(mode, path, blob_sha1)` entries.
///
/// Returns the root tree SHA-1 and every tree object created, deepest first.
#[must_use]
pub fn build_nested_trees(entries: &[(String, String, String)]) -> (String, Vec<GitObject>) {
    // dir path -> (mode, name, sha1) children
    let mut dirs: BTreeMap<String, Vec<(String, String, String)>> = BTreeMap::new();
    dirs.entry(String::new()).or_default();

    for (mode, path, sha1) in entries {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir.to_string(), name.to_string()),
            None => (String::new(), path.clone()),
        };
        // Register every ancestor directory.
        let mut ancestor = dir.clone();
        loop {
            dirs.entry(ancestor.clone()).or_default();
            match ancestor.rsplit_once('/') {
                Some((parent, _)) => ancestor = parent.to_string(),
                None => {
                    if !ancestor.is_empty() {
                        dirs.entry(String::new()).or_default();
                    }
                    break;
                }
            }
        }
        dirs.entry(dir).or_default().push((mode.clone(), name, sha1.clone()));
    }

    // Deepest directories first so parents can reference child tree ids.
    let mut dir_paths: Vec<String> = dirs.keys().cloned().collect();
    dir_paths.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count() + usize::from(!d.is_empty())));

    let mut tree_ids: BTreeMap<String, String> = BTreeMap::new();
    let mut tree_objects = Vec::new();

    for dir in dir_paths {
        let mut children = dirs.get(&dir).cloned().unwrap_or_default();

        // Attach subtrees of this directory.
        for (sub_path, sub_id) in &tree_ids {
            let (parent, name) = match sub_path.rsplit_once('/') {
                Some((parent, name)) => (parent.to_string(), name.to_string()),
                None => (String::new(), sub_path.clone()),
            };
            if parent == dir && !sub_path.is_empty() {
                children.push(("40000".to_string(), name, sub_id.clone()));
            }
        }

        let tree = create_tree_object(&children);
        tree_ids.insert(dir, tree.sha1.clone());
        tree_objects.push(tree);
    }

    let root = tree_ids.remove("").unwrap_or_default();
    (root, tree_objects)
}

/// Commit object over a root tree. Timestamps are unix epoch seconds.
#[must_use]
pub fn create_commit_object(
    tree_sha1: &str,
    parent_sha1s: &[String],
    author: &str,
    email: &str,
    timestamp: i64,
    message: &str,
) -> GitObject {
    let mut content = format!("tree {tree_sha1}\n");
    for parent in parent_sha1s {
        content.push_str(&format!("parent {parent}\n"));
    }
    content.push_str(&format!("author {author} <{email}> {timestamp} +0000\n"));
    content.push_str(&format!("committer {author} <{email}> {timestamp} +0000\n"));
    content.push('\n');
    content.push_str(message);
    if !message.ends_with('\n') {
        content.push('\n');
    }

    let content = content.into_bytes();
    GitObject {
        kind: ObjectKind::Commit,
        sha1: hash_object(ObjectKind::Commit, &content),
        content,
    }
}

fn pack_entry_header(kind: ObjectKind, size: usize) -> Vec<u8> {
    let mut header = Vec::new();
    let mut size = size;
    let mut byte = (kind.pack_type() << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        header.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    header.push(byte);
    header
}

/// Assemble a version-2 pack: header, varint-framed zlib entries, SHA-1
/// trailer over the whole stream.
#[must_use]
pub fn create_pack_file(objects: &[GitObject]) -> Vec<u8> {
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&(objects.len() as u32).to_be_bytes());

    for object in objects {
        pack.extend_from_slice(&pack_entry_header(object.kind, object.content.len()));
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        let _ = encoder.write_all(&object.content);
        pack.extend_from_slice(&encoder.finish().unwrap_or_default());
    }

    let mut hasher = Sha1::new();
    hasher.update(&pack);
    let trailer = hasher.finalize();
    pack.extend_from_slice(&trailer);
    pack
}

#[must_use]
pub fn create_empty_pack() -> Vec<u8> {
    create_pack_file(&[])
}

/// Encode one pkt-line: 4 hex length digits (including themselves) + payload.
#[must_use]
pub fn pkt_line(payload: &[u8]) -> Vec<u8> {
    let mut line = format!("{:04x}", payload.len() + 4).into_bytes();
    line.extend_from_slice(payload);
    line
}

/// The flush packet terminating a pkt-line section.
#[must_use]
pub fn flush_pkt() -> &'static [u8] {
    b"0000"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_and_tree_hash_to_known_ids() {
        assert_eq!(
            create_blob_object(b"").sha1,
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
        let (root, trees) = build_nested_trees(&[]);
        assert_eq!(root, "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
        assert_eq!(trees.len(), 1);
    }

    #[test]
    fn nested_trees_cover_all_directories() {
        let blob = create_blob_object(b"x");
        let entries = vec![
            ("100644".to_string(), "README.md".to_string(), blob.sha1.clone()),
            ("100644".to_string(), "src/lib.rs".to_string(), blob.sha1.clone()),
            ("100644".to_string(), "src/nested/deep.rs".to_string(), blob.sha1.clone()),
        ];
        let (root, trees) = build_nested_trees(&entries);
        assert_eq!(root.len(), 40);
        // Root, "src", and "src/nested".
        assert_eq!(trees.len(), 3);
        // The root tree is built last (parents after children).
        assert_eq!(trees.last().unwrap().sha1, root);
    }

    #[test]
    fn tree_entry_ordering_treats_dirs_with_trailing_slash() {
        // "foo-bar" sorts before the directory "foo" without the trailing
        // slash rule, after it with the rule ('-' < '/').
        let blob = create_blob_object(b"x");
        let entries = vec![
            ("100644".to_string(), "foo-bar".to_string(), blob.sha1.clone()),
            ("100644".to_string(), "foo/inner".to_string(), blob.sha1.clone()),
        ];
        let (_, trees) = build_nested_trees(&entries);
        let root = trees.last().unwrap();
        let content = String::from_utf8_lossy(&root.content);
        let foo_bar = content.find("foo-bar").unwrap();
        let foo = content.find("40000 foo").unwrap();
        assert!(foo_bar < foo);
    }

    #[test]
    fn commit_object_layout() {
        let commit = create_commit_object(
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904",
            &["a".repeat(40)],
            "alice",
            "alice@example.org",
            1700000000,
            "init",
        );
        let text = String::from_utf8(commit.content.clone()).unwrap();
        assert!(text.starts_with("tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n"));
        assert!(text.contains(&format!("parent {}\n", "a".repeat(40))));
        assert!(text.contains("author alice <alice@example.org> 1700000000 +0000\n"));
        assert!(text.ends_with("\ninit\n"));
    }

    #[test]
    fn pack_has_header_count_and_trailer() {
        let blob = create_blob_object(b"hello");
        let pack = create_pack_file(std::slice::from_ref(&blob));
        assert_eq!(&pack[0..4], b"PACK");
        assert_eq!(u32::from_be_bytes(pack[4..8].try_into().unwrap()), 2);
        assert_eq!(u32::from_be_bytes(pack[8..12].try_into().unwrap()), 1);

        let body = &pack[..pack.len() - 20];
        let mut hasher = Sha1::new();
        hasher.update(body);
        assert_eq!(&pack[pack.len() - 20..], hasher.finalize().as_slice());
    }

    #[test]
    fn empty_pack_has_zero_objects() {
        let pack = create_empty_pack();
        assert_eq!(u32::from_be_bytes(pack[8..12].try_into().unwrap()), 0);
        assert_eq!(pack.len(), 12 + 20);
    }

    #[test]
    fn pkt_line_encoding() {
        assert_eq!(pkt_line(b"a"), b"0005a");
        assert_eq!(flush_pkt(), b"0000");
    }

    #[test]
    fn lfs_pointer_format() {
        let pointer = String::from_utf8(create_lfs_pointer(&"ab".repeat(32), 123)).unwrap();
        assert!(pointer.starts_with("version https://git-lfs.github.com/spec/v1\n"));
        assert!(pointer.contains(&format!("oid sha256:{}\n", "ab".repeat(32))));
        assert!(pointer.ends_with("size 123\n"));
    }

    #[test]
    fn large_pack_entry_header_uses_continuation_bytes() {
        let header = pack_entry_header(ObjectKind::Blob, 1 << 20);
        assert!(header.len() > 1);
        assert_eq!(header[0] & 0x80, 0x80);
        assert_eq!(*header.last().unwrap() & 0x80, 0);
    }
}
