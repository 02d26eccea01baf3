#![allow(dead_code)]

use std::{
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

/// Runs a helper command to completion, it must exit with 0
pub fn spawn_child(command: &str, args: &[&str]) {
    let child = Command::new(env!("CARGO_BIN_EXE_test"))
        .env("RUST_BACKTRACE", "1")
        .arg(command)
        .args(args)
        .output()
        .expect("failed to execute child");

    println!("Child output:");
    std::io::stdout().write_all(&child.stdout).unwrap();
    std::io::stdout().write_all(&child.stderr).unwrap();
    assert_eq!(child.status.code().expect("No return value"), 0);
}

/// Starts a helper command with piped stdout and leaves it running
pub fn start_child_and_return(args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_test"))
        .env("RUST_BACKTRACE", "1")
        .args(args)
        .stdout(Stdio::piped())
        .spawn()
        .expect("failed to execute child")
}

/// Starts a helper with `num` threads, returns once all of them are running
pub fn start_child_and_wait_for_threads(num: usize) -> Child {
    let mut child = start_child_and_return(&["spawn_and_wait", &num.to_string()]);
    wait_for_threads(&mut child, num);
    child
}

/// Every helper thread prints a line once it runs
pub fn wait_for_threads(child: &mut Child, num: usize) {
    let mut f = BufReader::new(child.stdout.as_mut().expect("Can't open stdout"));
    let mut lines = 0;
    while lines < num {
        let mut buf = String::new();
        match f.read_line(&mut buf) {
            Ok(0) => panic!("child exited before all threads were up"),
            Ok(_) => {
                if buf == "1\n" {
                    lines += 1;
                }
            }
            Err(e) => std::panic::panic_any(e),
        }
    }
}

/// Reads one line of output from the child
pub fn read_line(child: &mut Child) -> String {
    let mut f = BufReader::new(child.stdout.as_mut().expect("Can't open stdout"));
    let mut buf = String::new();
    f.read_line(&mut buf).expect("Couldn't read from child");
    buf.trim_end().to_owned()
}

/// The minidumps written to `dir`
pub fn dumps_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .expect("Couldn't read the dump directory")
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "dmp"))
        .collect()
}
