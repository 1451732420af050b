use anyhow::Result;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use treesync::daemon;
use treesync::logger::{Logger, NoopLogger};
use treesync::protocol::{encode_verdict, Verdict, ENTRY_LEN};
use treesync::walker;

/// Bind a free port and run the daemon loop on a background thread against a
/// fresh tempdir root.
fn start_server() -> Result<(u16, tempfile::TempDir)> {
    let root = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let root_path = root.path().to_path_buf();
    std::thread::spawn(move || {
        let _ = daemon::serve_on(listener, &root_path, Arc::new(NoopLogger));
    });
    Ok((port, root))
}

fn push(tree: &Path, port: u16) -> Result<walker::PushStats> {
    walker::push(tree, "127.0.0.1", port, Arc::new(NoopLogger))
}

fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[test]
fn fresh_tree_then_idempotent_rerun() -> Result<()> {
    let (port, dest) = start_server()?;
    let src = tempfile::tempdir()?;
    let tree = src.path().join("tree");
    fs::create_dir_all(tree.join("sub"))?;
    fs::write(tree.join("a.txt"), b"0123456789")?;
    fs::write(tree.join("sub/b.txt"), b"")?;
    fs::write(tree.join(".hidden"), b"secret")?;
    fs::set_permissions(tree.join("a.txt"), fs::Permissions::from_mode(0o640))?;
    fs::set_permissions(tree.join("sub"), fs::Permissions::from_mode(0o750))?;

    let stats = push(&tree, port)?;
    assert_eq!(stats.errors, 0);
    // a.txt and the empty b.txt both need a data pass on a fresh destination
    assert_eq!(stats.transfers, 2);

    assert_eq!(fs::read(dest.path().join("tree/a.txt"))?, b"0123456789");
    assert_eq!(fs::metadata(dest.path().join("tree/sub/b.txt"))?.len(), 0);
    assert_eq!(mode_of(&dest.path().join("tree/a.txt")), 0o640);
    assert_eq!(mode_of(&dest.path().join("tree/sub")), 0o750);
    // Dotfiles are never walked
    assert!(!dest.path().join("tree/.hidden").exists());

    // Second run with no source changes transfers nothing
    let again = push(&tree, port)?;
    assert_eq!(again.errors, 0);
    assert_eq!(again.transfers, 0);
    Ok(())
}

#[test]
fn same_size_different_content_is_overwritten() -> Result<()> {
    let (port, dest) = start_server()?;
    let src = tempfile::tempdir()?;
    let tree = src.path().join("tree");
    fs::create_dir_all(&tree)?;
    fs::write(tree.join("a.txt"), b"fresh data")?;

    // Destination already has a same-size file with different bytes
    fs::create_dir_all(dest.path().join("tree"))?;
    fs::write(dest.path().join("tree/a.txt"), b"stale data")?;

    let stats = push(&tree, port)?;
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.transfers, 1);
    // Overwritten in place, not appended onto the stale copy
    assert_eq!(fs::read(dest.path().join("tree/a.txt"))?, b"fresh data");
    Ok(())
}

#[test]
fn type_mismatch_errors_but_walk_continues() -> Result<()> {
    let (port, dest) = start_server()?;
    let src = tempfile::tempdir()?;
    let tree = src.path().join("tree");
    fs::create_dir_all(&tree)?;
    fs::write(tree.join("a.txt"), b"file contents")?;
    fs::write(tree.join("c.txt"), b"sibling")?;

    // Destination has a directory where the source has a regular file
    fs::create_dir_all(dest.path().join("tree/a.txt"))?;

    let stats = push(&tree, port)?;
    assert_eq!(stats.errors, 1);
    // No data transfer for the mismatched entry; the sibling still arrives
    assert_eq!(stats.transfers, 1);
    assert!(dest.path().join("tree/a.txt").is_dir());
    assert_eq!(fs::read(dest.path().join("tree/c.txt"))?, b"sibling");
    Ok(())
}

#[test]
fn symlinks_are_never_transmitted() -> Result<()> {
    let (port, dest) = start_server()?;
    let src = tempfile::tempdir()?;
    let tree = src.path().join("tree");
    fs::create_dir_all(&tree)?;
    fs::write(tree.join("real.txt"), b"real")?;
    std::os::unix::fs::symlink("real.txt", tree.join("link"))?;

    let stats = push(&tree, port)?;
    assert_eq!(stats.errors, 0);
    // Only the root directory and the regular file produce descriptors
    assert_eq!(stats.entries, 2);
    assert!(dest.path().join("tree/real.txt").exists());
    assert!(!dest.path().join("tree/link").exists());
    assert!(fs::symlink_metadata(dest.path().join("tree/link")).is_err());
    Ok(())
}

#[test]
fn chunk_boundary_round_trips() -> Result<()> {
    let (port, dest) = start_server()?;
    let src = tempfile::tempdir()?;
    let tree = src.path().join("tree");
    fs::create_dir_all(&tree)?;

    // Exactly n*256 bytes exercises the end-of-payload boundary; n*256+1
    // produces a one-byte final chunk.
    let sizes: [usize; 4] = [256, 257, 512, 1024];
    for size in sizes {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        fs::write(tree.join(format!("f{}", size)), &data)?;
    }

    let stats = push(&tree, port)?;
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.transfers, sizes.len() as u64);
    for size in sizes {
        let expect: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs::read(dest.path().join(format!("tree/f{}", size)))?, expect);
    }

    let again = push(&tree, port)?;
    assert_eq!(again.transfers, 0);
    assert_eq!(again.errors, 0);
    Ok(())
}

/// Captures transfer completions so tests can observe worker joins.
#[derive(Default)]
struct RecordingLogger(Mutex<Vec<String>>);

impl Logger for RecordingLogger {
    fn transfer(&self, path: &str, bytes: u64) {
        self.0.lock().unwrap().push(format!("{} {}", path, bytes));
    }
}

#[test]
fn control_failure_still_joins_inflight_transfers() -> Result<()> {
    let src = tempfile::tempdir()?;
    let tree = src.path().join("tree");
    fs::create_dir_all(&tree)?;
    fs::write(tree.join("a.txt"), b"aaaaa")?;
    fs::write(tree.join("b.txt"), b"bbbbb")?;

    // Scripted daemon: serve the directory and the first file normally, let
    // the data connection complete, then drop the control connection so the
    // next descriptor exchange fails mid-walk.
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    std::thread::spawn(move || -> Result<()> {
        let (mut control, _) = listener.accept()?;
        let mut desc = [0u8; ENTRY_LEN];
        control.read_exact(&mut desc)?; // directory
        control.write_all(&encode_verdict(Verdict::Ok))?;
        control.read_exact(&mut desc)?; // first file
        control.write_all(&encode_verdict(Verdict::SendData))?;

        let (mut data, _) = listener.accept()?;
        data.read_exact(&mut desc)?;
        let size = u16::from_be_bytes([desc[ENTRY_LEN - 2], desc[ENTRY_LEN - 1]]) as usize;
        let mut payload = vec![0u8; size];
        data.read_exact(&mut payload)?;
        data.write_all(&encode_verdict(Verdict::Ok))?;

        drop(control);
        Ok(())
    });

    let rec = Arc::new(RecordingLogger::default());
    let result = walker::push(&tree, "127.0.0.1", port, rec.clone());
    assert!(result.is_err());

    // The in-flight worker was joined and its outcome reported even though
    // the walk aborted.
    let transfers = rec.0.lock().unwrap();
    assert_eq!(transfers.len(), 1);
    assert!(transfers[0].starts_with("tree/"));
    assert!(transfers[0].ends_with(" 5"));
    Ok(())
}

#[test]
fn oversized_file_is_reported_and_skipped() -> Result<()> {
    let (port, dest) = start_server()?;
    let src = tempfile::tempdir()?;
    let tree = src.path().join("tree");
    fs::create_dir_all(&tree)?;
    // Larger than the 16-bit wire size field can describe
    fs::write(tree.join("big.bin"), vec![7u8; 70_000])?;
    fs::write(tree.join("small.txt"), b"ok")?;

    let stats = push(&tree, port)?;
    assert_eq!(stats.errors, 1);
    assert!(!dest.path().join("tree/big.bin").exists());
    assert_eq!(fs::read(dest.path().join("tree/small.txt"))?, b"ok");
    Ok(())
}
