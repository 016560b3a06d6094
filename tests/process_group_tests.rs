//! Integration tests for child process cleanup
//!
//! These verify that:
//! 1. Children spawned with in_new_process_group() lead their own group
//! 2. ChildRegistry::terminate_all() takes down the whole process tree
//! 3. SystemRunner leaves nothing registered once a command returns

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpgid, Pid};

use provisor::process_guard::{ChildRegistry, CommandProcessGroup};
use provisor::{CommandRunner, SystemRunner};

/// Alive means it exists and is not a zombie
fn is_process_alive(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !matches!(stat.split_whitespace().nth(2), Some("Z" | "X")),
        Err(_) => false,
    }
}

fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_child_leads_its_own_process_group() {
    let mut child = Command::new("sleep")
        .arg("30")
        .stdin(Stdio::null())
        .in_new_process_group()
        .spawn()
        .expect("Failed to spawn sleep");

    let pid = Pid::from_raw(child.id() as i32);
    let pgid = getpgid(Some(pid)).expect("getpgid");
    assert_eq!(pgid, pid);
    assert_ne!(pgid, getpgid(None).expect("own pgid"));

    let _ = kill(pid, Signal::SIGKILL);
    let _ = child.wait();
}

#[test]
fn test_terminate_all_kills_the_tree() {
    let mut parent = Command::new("sh")
        .args(["-c", "sleep 1000 & echo $!; wait"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .in_new_process_group()
        .spawn()
        .expect("Failed to spawn parent shell");
    let parent_pid = parent.id();

    let mut line = String::new();
    if let Some(stdout) = parent.stdout.take() {
        use std::io::BufRead;
        std::io::BufReader::new(stdout)
            .read_line(&mut line)
            .expect("read child pid");
    }
    let child_pid: u32 = line.trim().parse().expect("child pid");
    assert!(is_process_alive(child_pid), "sleep should be alive");

    let mut registry = ChildRegistry::default();
    registry.register(parent_pid);
    registry.terminate_all(Duration::from_secs(2));
    assert_eq!(registry.count(), 0);

    let _ = parent.wait();
    let child_died = wait_for_process_death(child_pid, Duration::from_secs(3));
    if !child_died {
        let _ = kill(Pid::from_raw(child_pid as i32), Signal::SIGKILL);
    }
    assert!(child_died, "grandchild {child_pid} should die with its group");
}

#[test]
fn test_runner_unregisters_finished_commands() {
    let runner = SystemRunner::new();
    let out = runner
        .run(&["sh".to_string(), "-c".to_string(), "echo ok".to_string()])
        .expect("sh runs");
    assert_eq!(out.stdout.trim(), "ok");

    let registry = ChildRegistry::global().lock().unwrap();
    assert_eq!(registry.count(), 0);
}
