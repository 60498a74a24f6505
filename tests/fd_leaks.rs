//! Descriptor accounting across spawns
//!
//! Counts the entries of /proc/self/fd before and after each scenario. Tests
//! in this file share one lock so no other spawn is in flight while counting.

#![cfg(target_os = "linux")]

use std::fs;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

use nix::unistd::{close, dup, dup2};

use mochi_spawn::{Error, ProcessStatus, RedirectionPlanner, SpawnRequest, StreamRedirection};

static FD_LOCK: Mutex<()> = Mutex::new(());

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

fn assert_no_leak(label: &str, scenario: impl FnOnce()) {
    let _guard = FD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let before = open_fds();
    scenario();
    let after = open_fds();
    assert_eq!(before, after, "{}: descriptor count changed", label);
}

#[test]
fn test_pipes_keep_only_parent_ends() {
    let _guard = FD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let before = open_fds();

    let mut child = SpawnRequest::new("cat")
        .stdin(StreamRedirection::Pipe)
        .stdout(StreamRedirection::Pipe)
        .stderr(StreamRedirection::Pipe)
        .spawn()
        .unwrap();
    // One parent end per piped slot; the child halves are already closed
    assert_eq!(open_fds(), before + 3);

    drop(child.take_stdin());
    let mut out = Vec::new();
    child.stdout().unwrap().read_to_end(&mut out).unwrap();
    assert!(out.is_empty());
    assert_eq!(child.close(false).unwrap(), ProcessStatus::Exited(0));
    assert_eq!(open_fds(), before);
}

#[test]
fn test_failed_exec_leaks_nothing() {
    assert_no_leak("failed exec", || {
        let result = SpawnRequest::new("/nonexistent/program")
            .stdin(StreamRedirection::Pipe)
            .stdout(StreamRedirection::Pipe)
            .stderr(StreamRedirection::Pty)
            .spawn();
        assert!(matches!(result, Err(Error::Spawn { .. })));
    });
}

#[test]
fn test_rejected_descriptor_leaks_nothing() {
    assert_no_leak("rejected descriptor", || {
        let result = SpawnRequest::new("true")
            .stdin(StreamRedirection::Pipe)
            .stdout(StreamRedirection::fd(-1))
            .spawn();
        assert!(matches!(result, Err(Error::Redirection { .. })));
    });
}

#[test]
fn test_dropped_plan_closes_everything() {
    assert_no_leak("dropped plan", || {
        let plan = RedirectionPlanner::new()
            .plan(
                StreamRedirection::Pipe,
                StreamRedirection::Pty,
                StreamRedirection::Pty,
            )
            .unwrap();
        assert!(plan.uses_pty());
        drop(plan);
    });
}

#[test]
fn test_pty_handle_closes_master() {
    assert_no_leak("pty handle", || {
        let mut child = SpawnRequest::shell("exit 0")
            .stdin(StreamRedirection::Pty)
            .stdout(StreamRedirection::Pty)
            .spawn()
            .unwrap();
        child.close(false).unwrap();
        drop(child);
    });
}

#[test]
fn test_owned_descriptor_is_consumed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("owned.log");
    assert_no_leak("owned descriptor", || {
        let file = fs::File::create(&path).unwrap();
        let mut child = SpawnRequest::shell("echo owned")
            .stdout(StreamRedirection::from(file))
            .spawn()
            .unwrap();
        child.close(false).unwrap();
    });
    assert_eq!(fs::read_to_string(&path).unwrap(), "owned\n");
}

#[test]
fn test_owned_descriptor_numbered_as_a_slot() {
    let _guard = FD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slot.log");
    let file = fs::File::create(&path).unwrap();

    // Park our stdin and hand the file over as descriptor 0
    let saved_stdin = dup(libc::STDIN_FILENO).unwrap();
    dup2(file.as_raw_fd(), libc::STDIN_FILENO).unwrap();
    drop(file);
    // SAFETY: fd 0 now refers to the file and nothing else claims it
    let owned = unsafe { OwnedFd::from_raw_fd(libc::STDIN_FILENO) };

    // stdin is planned first; without lifting, its /dev/null would land on
    // the file's number before stdout duplicates it
    let result = SpawnRequest::shell("echo out")
        .stdin(StreamRedirection::Null)
        .stdout(StreamRedirection::owned(owned))
        .spawn()
        .and_then(|mut child| child.close(false));

    dup2(saved_stdin, libc::STDIN_FILENO).unwrap();
    close(saved_stdin).unwrap();

    assert_eq!(result.unwrap(), ProcessStatus::Exited(0));
    assert_eq!(fs::read_to_string(&path).unwrap(), "out\n");
}

#[test]
fn test_owned_stdout_number_onto_stderr() {
    let _guard = FD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("err.log");
    let file = fs::File::create(&path).unwrap();

    // Same collision with fd 1: stdout's pipe would overwrite it in the child
    let saved_stdout = dup(libc::STDOUT_FILENO).unwrap();
    dup2(file.as_raw_fd(), libc::STDOUT_FILENO).unwrap();
    drop(file);
    // SAFETY: fd 1 now refers to the file and nothing else claims it
    let owned = unsafe { OwnedFd::from_raw_fd(libc::STDOUT_FILENO) };

    let result = SpawnRequest::shell("echo out; echo err >&2")
        .stdout(StreamRedirection::Pipe)
        .stderr(StreamRedirection::owned(owned))
        .spawn()
        .and_then(|mut child| {
            let mut out = String::new();
            child.stdout().unwrap().read_to_string(&mut out)?;
            Ok((out, child.close(false)?))
        });

    dup2(saved_stdout, libc::STDOUT_FILENO).unwrap();
    close(saved_stdout).unwrap();

    let (out, status) = result.unwrap();
    assert!(status.success());
    assert_eq!(out, "out\n");
    assert_eq!(fs::read_to_string(&path).unwrap(), "err\n");
}
