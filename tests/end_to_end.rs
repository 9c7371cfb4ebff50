//! End-to-end scenarios driven through `session::run` via the `-u` local
//! pack file mode, so no live Git server is needed.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use gitup::cli::Cli;
use gitup::hash::{canonical_hash, ObjectKind};
use gitup::session;

fn write_object_header(out: &mut Vec<u8>, type_tag: u8, mut size: usize) {
    let mut first = ((type_tag & 0x07) << 4) | (size & 0x0f) as u8;
    size >>= 4;
    if size > 0 {
        first |= 0x80;
    }
    out.push(first);
    while size > 0 {
        let mut byte = (size & 0x7f) as u8;
        size >>= 7;
        if size > 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
}

fn deflate(payload: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(payload).unwrap();
    enc.finish().unwrap()
}

enum ObjSpec {
    Plain(u8, Vec<u8>),
    RefDelta([u8; 20], Vec<u8>),
}

fn build_pack(objects: &[ObjSpec]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    let mut body = Vec::new();
    body.extend_from_slice(b"PACK");
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&(objects.len() as u32).to_be_bytes());

    for obj in objects {
        match obj {
            ObjSpec::Plain(type_tag, payload) => {
                write_object_header(&mut body, *type_tag, payload.len());
                body.extend_from_slice(&deflate(payload));
            }
            ObjSpec::RefDelta(base_hash, program) => {
                write_object_header(&mut body, 7, program.len());
                body.extend_from_slice(base_hash);
                body.extend_from_slice(&deflate(program));
            }
        }
    }

    let mut hasher = Sha1::new();
    hasher.update(&body);
    body.extend_from_slice(&hasher.finalize());
    body
}

fn varint(mut n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if n == 0 {
            break;
        }
    }
    out
}

fn copy_instruction(offset: u32, length: u32) -> Vec<u8> {
    let mut out = vec![0x80u8 | 0x01 | 0x10]; // offset byte0 present, length byte0 present
    out.push((offset & 0xff) as u8);
    out.push((length & 0xff) as u8);
    out
}

fn tree_buffer(entries: &[(u32, &str, gitup::hash::ObjectHash)]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for (mode, name, hash) in entries {
        buffer.extend_from_slice(format!("{:o} {}\0", mode, name).as_bytes());
        buffer.extend_from_slice(&hash.0);
    }
    buffer
}

fn commit_body(tree_hash: gitup::hash::ObjectHash) -> Vec<u8> {
    format!("tree {}\nauthor t <t@t> 0 +0000\n\nmsg\n", tree_hash.to_hex()).into_bytes()
}

struct Fixture {
    target_dir: PathBuf,
    work_dir: PathBuf,
    config_path: PathBuf,
    _tmp: tempfile::TempDir,
}

fn setup() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let target_dir = tmp.path().join("target");
    let work_dir = tmp.path().join("work");
    fs::create_dir_all(&target_dir).unwrap();
    fs::create_dir_all(&work_dir).unwrap();

    let config_path = tmp.path().join("gitup.conf");
    fs::write(
        &config_path,
        format!(
            "[demo]\nhost = git.example.org\nrepository_path = /os/demo.git\ntarget_directory = {}\nwork_directory = {}\n",
            target_dir.display(),
            work_dir.display(),
        ),
    )
    .unwrap();

    Fixture { target_dir, work_dir, config_path, _tmp: tmp }
}

fn base_cli(fixture: &Fixture, pack_path: &Path, want_hex: &str) -> Cli {
    Cli {
        section: "demo".to_string(),
        config_path: Some(fixture.config_path.clone()),
        force_clone: false,
        display_depth: None,
        have: None,
        keep_pack: false,
        low_memory: false,
        force_repair: false,
        tag: None,
        local_pack: Some(pack_path.to_path_buf()),
        verbosity: 0,
        want: Some(want_hex.to_string()),
    }
}

#[test]
fn clone_from_empty_writes_file_with_correct_mode() {
    let fixture = setup();

    let blob_hash = canonical_hash(ObjectKind::Blob, b"hello\n");
    let tree_hash = canonical_hash(ObjectKind::Tree, &tree_buffer(&[(0o100644, "a.txt", blob_hash)]));
    let commit = commit_body(tree_hash);
    let commit_hash = canonical_hash(ObjectKind::Commit, &commit);

    let pack = build_pack(&[
        ObjSpec::Plain(1, commit),
        ObjSpec::Plain(2, tree_buffer(&[(0o100644, "a.txt", blob_hash)])),
        ObjSpec::Plain(3, b"hello\n".to_vec()),
    ]);
    let pack_path = fixture.work_dir.join("clone.pack");
    fs::write(&pack_path, &pack).unwrap();

    let cli = base_cli(&fixture, &pack_path, &commit_hash.to_hex());
    let report = session::run(&cli).unwrap();

    let written = fixture.target_dir.join("a.txt");
    assert_eq!(fs::read(&written).unwrap(), b"hello\n");
    assert_eq!(fs::metadata(&written).unwrap().permissions().mode() & 0o7777, 0o644);
    assert_eq!(report.want, commit_hash);

    let manifest_text = fs::read_to_string(fixture.work_dir.join("demo")).unwrap();
    assert!(manifest_text.starts_with(&commit_hash.to_hex()));
}

#[test]
fn zero_object_pack_produces_no_writes() {
    let fixture = setup();
    let pack = build_pack(&[]);
    let pack_path = fixture.work_dir.join("empty.pack");
    fs::write(&pack_path, &pack).unwrap();

    let some_commit = canonical_hash(ObjectKind::Commit, b"whatever");
    let cli = base_cli(&fixture, &pack_path, &some_commit.to_hex());
    session::run(&cli).unwrap();

    assert!(fs::read_dir(&fixture.target_dir).unwrap().next().is_none());
}

#[test]
fn incremental_pull_applies_ref_delta() {
    let fixture = setup();

    // Seed an existing a.txt as if scenario 1 already ran.
    fs::write(fixture.target_dir.join("a.txt"), b"hello\n").unwrap();

    let base_blob_hash = canonical_hash(ObjectKind::Blob, b"hello\n");
    let mut program = varint(6);
    program.extend(varint(12));
    program.extend(copy_instruction(0, 5)); // copy "hello"
    let insert = b" world!";
    program.push(insert.len() as u8);
    program.extend_from_slice(insert);
    let new_blob_hash = canonical_hash(ObjectKind::Blob, b"hello world!");

    let tree_hash = canonical_hash(ObjectKind::Tree, &tree_buffer(&[(0o100644, "a.txt", new_blob_hash)]));
    let commit = commit_body(tree_hash);
    let commit_hash = canonical_hash(ObjectKind::Commit, &commit);

    let pack = build_pack(&[
        ObjSpec::Plain(1, commit),
        ObjSpec::Plain(2, tree_buffer(&[(0o100644, "a.txt", new_blob_hash)])),
        ObjSpec::Plain(3, b"hello\n".to_vec()),
        ObjSpec::RefDelta(base_blob_hash.0, program),
    ]);
    let pack_path = fixture.work_dir.join("pull.pack");
    fs::write(&pack_path, &pack).unwrap();

    let cli = base_cli(&fixture, &pack_path, &commit_hash.to_hex());
    session::run(&cli).unwrap();

    assert_eq!(fs::read(fixture.target_dir.join("a.txt")).unwrap(), b"hello world!");
}

#[test]
fn repair_restores_corrupted_file_without_deleting_others() {
    let fixture = setup();
    fs::write(fixture.target_dir.join("a.txt"), b"corrupted").unwrap();

    let blob_hash = canonical_hash(ObjectKind::Blob, b"hello\n");
    let tree_hash = canonical_hash(ObjectKind::Tree, &tree_buffer(&[(0o100644, "a.txt", blob_hash)]));
    let commit = commit_body(tree_hash);
    let commit_hash = canonical_hash(ObjectKind::Commit, &commit);

    let pack = build_pack(&[
        ObjSpec::Plain(1, commit),
        ObjSpec::Plain(2, tree_buffer(&[(0o100644, "a.txt", blob_hash)])),
        ObjSpec::Plain(3, b"hello\n".to_vec()),
    ]);
    let pack_path = fixture.work_dir.join("repair.pack");
    fs::write(&pack_path, &pack).unwrap();

    let mut cli = base_cli(&fixture, &pack_path, &commit_hash.to_hex());
    cli.force_repair = true;
    session::run(&cli).unwrap();

    assert_eq!(fs::read(fixture.target_dir.join("a.txt")).unwrap(), b"hello\n");
}

#[test]
fn symlink_materializes_with_exact_target() {
    let fixture = setup();

    let link_hash = canonical_hash(ObjectKind::Blob, b"a.txt");
    let tree_hash = canonical_hash(ObjectKind::Tree, &tree_buffer(&[(0o120000, "link", link_hash)]));
    let commit = commit_body(tree_hash);
    let commit_hash = canonical_hash(ObjectKind::Commit, &commit);

    let pack = build_pack(&[
        ObjSpec::Plain(1, commit),
        ObjSpec::Plain(2, tree_buffer(&[(0o120000, "link", link_hash)])),
        ObjSpec::Plain(3, b"a.txt".to_vec()),
    ]);
    let pack_path = fixture.work_dir.join("symlink.pack");
    fs::write(&pack_path, &pack).unwrap();

    let cli = base_cli(&fixture, &pack_path, &commit_hash.to_hex());
    session::run(&cli).unwrap();

    assert_eq!(fs::read_link(fixture.target_dir.join("link")).unwrap(), PathBuf::from("a.txt"));
}

#[test]
fn deletion_removes_file_no_longer_in_tree() {
    let fixture = setup();
    fs::write(fixture.target_dir.join("gone.txt"), b"bye\n").unwrap();

    let tree_hash = canonical_hash(ObjectKind::Tree, &tree_buffer(&[]));
    let commit = commit_body(tree_hash);
    let commit_hash = canonical_hash(ObjectKind::Commit, &commit);

    let pack = build_pack(&[ObjSpec::Plain(1, commit), ObjSpec::Plain(2, tree_buffer(&[]))]);
    let pack_path = fixture.work_dir.join("deletion.pack");
    fs::write(&pack_path, &pack).unwrap();

    let cli = base_cli(&fixture, &pack_path, &commit_hash.to_hex());
    session::run(&cli).unwrap();

    assert!(!fixture.target_dir.join("gone.txt").exists());
}
