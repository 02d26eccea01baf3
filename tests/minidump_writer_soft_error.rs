#![cfg(any(target_os = "linux", target_os = "android"))]

use {
    common::*,
    minidump::*,
    minidump_common::format::{MINIDUMP_DIRECTORY, MINIDUMP_HEADER, MINIDUMP_STREAM_TYPE},
    minidump_handler::{
        FailSpotName,
        errors::{SectionSystemInfoError, WriterError},
        exception_handler::ExceptionHandler,
        minidump_descriptor::MinidumpDescriptor,
        minidump_writer::MinidumpWriter,
    },
    scroll::Pread,
};

mod common;

/// Writes a dump of a fresh helper with the given failure switched on
fn dump_with_failure(spot: FailSpotName) -> (Vec<u8>, Result<Vec<WriterError>, WriterError>) {
    let mut client = FailSpotName::testing_client();
    client.set_enabled(spot, true);

    let mut child = start_child_and_wait_for_threads(1);
    let pid = child.id() as i32;
    let mut tmpfile = tempfile::Builder::new()
        .prefix("soft_error")
        .tempfile()
        .unwrap();

    let result = MinidumpWriter::new(pid, pid)
        .dump(&mut tmpfile)
        .map(|errors| errors.into_iter().collect());
    drop(client);

    child.kill().unwrap();
    child.wait().unwrap();

    (std::fs::read(tmpfile.path()).unwrap(), result)
}

fn directory(bytes: &[u8]) -> Vec<MINIDUMP_DIRECTORY> {
    let header: MINIDUMP_HEADER = bytes.pread_with(0, scroll::LE).unwrap();
    let mut offset = header.stream_directory_rva as usize;
    (0..header.stream_count)
        .map(|_| bytes.gread_with(&mut offset, scroll::LE).unwrap())
        .collect()
}

fn assert_read_failed(errors: &[WriterError], path: &str) {
    assert!(
        errors
            .iter()
            .any(|e| matches!(e, WriterError::ReadFileFailed(p, _) if p == path)),
        "no read failure for {path} in {errors:?}"
    );
}

#[test]
fn test_lsb_release_failure_nulls_its_entry() {
    let (bytes, result) = dump_with_failure(FailSpotName::LsbReleaseRead);
    let errors = result.expect("The dump itself must succeed");
    assert_read_failed(&errors, "/etc/lsb-release");

    let entries = directory(&bytes);
    assert_eq!(entries.len(), 13);
    assert!(
        !entries
            .iter()
            .any(|e| e.stream_type == MINIDUMP_STREAM_TYPE::LinuxLsbRelease as u32)
    );
    let nulled = entries.iter().filter(|e| e.stream_type == 0).count();
    assert!(nulled >= 1);
    for entry in entries.iter().filter(|e| e.stream_type == 0) {
        assert_eq!(entry.location.rva, 0);
        assert_eq!(entry.location.data_size, 0);
    }

    // Everything else is still readable
    let dump = Minidump::read(bytes.as_slice()).expect("Failed to parse");
    let _: MinidumpThreadList = dump.get_stream().expect("No thread list");
    let _: MinidumpModuleList = dump.get_stream().expect("No module list");
    let _: MinidumpSystemInfo = dump.get_stream().expect("No system info");
}

#[test]
fn test_proc_status_failure_nulls_its_entry() {
    let (bytes, result) = dump_with_failure(FailSpotName::ProcStatusRead);
    let errors = result.expect("The dump itself must succeed");
    assert!(
        errors
            .iter()
            .any(|e| matches!(e, WriterError::ReadFileFailed(p, _) if p.ends_with("/status")))
    );

    let entries = directory(&bytes);
    assert!(
        !entries
            .iter()
            .any(|e| e.stream_type == MINIDUMP_STREAM_TYPE::LinuxProcStatus as u32)
    );

    let dump = Minidump::read(bytes.as_slice()).expect("Failed to parse");
    let _: MinidumpException = dump.get_stream().expect("No exception stream");
}

#[test]
fn test_cpu_info_failure_is_soft() {
    let (bytes, result) = dump_with_failure(FailSpotName::CpuInfoFileOpen);
    let errors = result.expect("The dump itself must succeed");
    assert!(errors.iter().any(|e| matches!(
        e,
        WriterError::WriteSystemInfoErrors(list)
            if list.iter().any(|e| matches!(e, SectionSystemInfoError::CpuInfoError(_)))
    )));

    let dump = Minidump::read(bytes.as_slice()).expect("Failed to parse");
    let _: MinidumpSystemInfo = dump.get_stream().expect("No system info");
}

#[test]
fn test_suspend_failure_is_fatal() {
    let (_, result) = dump_with_failure(FailSpotName::SuspendThreads);
    assert!(result.is_err());
}

#[test]
fn test_missing_auxv_is_fatal() {
    let (_, result) = dump_with_failure(FailSpotName::FillMissingAuxvInfo);
    assert!(matches!(result, Err(WriterError::InitError(_))));
}

#[test]
fn test_clone_failure_fails_the_dump() {
    let mut client = FailSpotName::testing_client();
    client.set_enabled(FailSpotName::CloneDumper, true);

    let dir = tempfile::tempdir().unwrap();
    let handler = ExceptionHandler::new(MinidumpDescriptor::new(dir.path()), None, None, false, None)
        .expect("Couldn't create the handler");
    assert!(!handler.write_minidump());
    drop(client);

    assert!(dumps_in(dir.path()).is_empty());
}
