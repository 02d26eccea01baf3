#![cfg(any(target_os = "linux", target_os = "android"))]

use {
    common::*,
    error_graph::{ErrorList, WriteErrorList},
    minidump_handler::{
        errors::WriterError,
        ptrace_dumper::{Dumper, PtraceDumper},
    },
    nix::sys::signal::Signal,
    std::os::unix::process::ExitStatusExt,
};

mod common;

#[test]
fn test_setup() {
    spawn_child("setup", &[]);
}

#[test]
fn test_thread_list_from_child() {
    // Child spawns and looks in the parent (== this process) for its own thread-ID
    spawn_child("thread_list", &[]);
}

#[test]
fn test_thread_list_from_parent() {
    let num_of_threads = 5;
    let mut child = start_child_and_wait_for_threads(num_of_threads);
    let pid = child.id() as i32;
    let mut dumper = PtraceDumper::new(pid).expect("Couldn't init dumper");
    assert_eq!(dumper.threads().len(), num_of_threads);
    let mut soft_errors = ErrorList::default();
    dumper
        .suspend_threads(soft_errors.subwriter(WriterError::SuspendThreadsErrors))
        .expect("Could not suspend threads");
    assert!(soft_errors.is_empty(), "{soft_errors:?}");

    for idx in 0..dumper.threads().len() {
        let info = dumper
            .get_thread_info_by_index(idx)
            .expect("Could not get thread info by index");
        let (_stack_ptr, stack_len) = dumper
            .get_stack_info(info.stack_pointer)
            .expect("Could not get stack_pointer");
        assert!(stack_len > 0);
    }
    dumper.resume_threads(soft_errors.subwriter(WriterError::ResumeThreadsErrors));
    assert!(soft_errors.is_empty(), "{soft_errors:?}");
    child.kill().expect("Failed to kill process");

    // Reap child
    let waitres = child.wait().expect("Failed to wait for child");
    let status = waitres.signal().expect("Child did not die due to signal");
    assert_eq!(waitres.code(), None);
    assert_eq!(status, Signal::SIGKILL as i32);
}

#[test]
fn test_own_process_is_rejected() {
    assert!(PtraceDumper::new(std::process::id() as i32).is_err());
}

#[test]
// Ensure that the linux-gate VDSO is included in the mapping list.
fn test_mappings_include_linux_gate() {
    spawn_child("mappings_include_linux_gate", &[]);
}

#[test]
fn test_file_id() {
    let exe = std::env::current_exe().unwrap();
    spawn_child("file_id", &[exe.to_str().unwrap()]);
}

#[test]
fn test_find_mapping() {
    spawn_child(
        "find_mappings",
        &[
            &format!("{}", libc::printf as *const () as usize),
            &format!("{}", String::new as *const () as usize),
        ],
    );
}

#[test]
fn test_copy_from_process_self() {
    let stack_var: usize = 0x11223344;
    let heap_var: Box<usize> = Box::new(0x55667788);
    spawn_child(
        "copy_from_process",
        &[
            &format!("{}", &stack_var as *const usize as usize),
            &format!("{}", heap_var.as_ref() as *const usize as usize),
        ],
    );
}
