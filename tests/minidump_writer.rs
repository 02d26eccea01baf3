#![cfg(any(target_os = "linux", target_os = "android"))]

use {
    common::*,
    minidump::*,
    minidump_common::format::MINIDUMP_STREAM_TYPE::*,
    minidump_handler::{
        minidump_format::MD_EXCEPTION_CODE_DUMP_REQUESTED,
        app_memory::AppMemoryList,
        maps_reader::{MMPermissions, MappingEntry, MappingInfo, SystemMappingInfo},
        minidump_writer::{MinidumpWriter, StackLimits},
        ptrace_dumper::DEFACED_VALUE,
    },
    nix::sys::signal::Signal,
    std::{os::unix::process::ExitStatusExt, str::FromStr},
};

mod common;

fn kill_and_reap(mut child: std::process::Child) {
    child.kill().expect("Failed to kill process");
    let waitres = child.wait().expect("Failed to wait for child");
    let status = waitres.signal().expect("Child did not die due to signal");
    assert_eq!(waitres.code(), None);
    assert_eq!(status, Signal::SIGKILL as i32);
}

#[test]
fn test_write_dump() {
    let num_of_threads = 3;
    let child = start_child_and_wait_for_threads(num_of_threads);
    let pid = child.id() as i32;

    let mut tmpfile = tempfile::Builder::new()
        .prefix("write_dump")
        .tempfile()
        .unwrap();

    MinidumpWriter::new(pid, pid)
        .dump(&mut tmpfile)
        .expect("Could not write minidump");
    kill_and_reap(child);

    let meta = std::fs::metadata(tmpfile.path()).expect("Couldn't get metadata for tempfile");
    assert!(meta.len() > 0);

    let dump = Minidump::read_path(tmpfile.path()).expect("Failed to read minidump");
    let threads: MinidumpThreadList = dump.get_stream().expect("Couldn't find MinidumpThreadList");
    assert_eq!(threads.threads.len(), num_of_threads);

    // Without a crash the blamed thread is reported as a dump request
    let exception: MinidumpException = dump.get_stream().expect("Couldn't find MinidumpException");
    assert_eq!(exception.get_crashing_thread_id(), pid as u32);
    assert_eq!(
        exception.raw.exception_record.exception_code,
        MD_EXCEPTION_CODE_DUMP_REQUESTED
    );
    assert_ne!(exception.raw.exception_record.exception_address, 0);
}

#[test]
fn test_write_and_read_dump_from_parent() {
    let mut child = start_child_and_return(&["spawn_mmap_wait"]);
    let pid = child.id() as i32;

    let mut tmpfile = tempfile::Builder::new()
        .prefix("write_dump")
        .tempfile()
        .unwrap();

    let line = read_line(&mut child);
    let mut output = line.split_whitespace();
    let mmap_addr = usize::from_str(output.next().unwrap()).expect("unable to parse mmap_addr");
    let memory_size = usize::from_str(output.next().unwrap()).expect("unable to parse memory_size");
    // Add information about the mapped memory.
    let mapping = MappingInfo {
        start_address: mmap_addr,
        size: memory_size,
        offset: 0,
        permissions: MMPermissions::READ | MMPermissions::WRITE,
        name: Some("a fake mapping".into()),
        system_mapping_info: SystemMappingInfo {
            start_address: mmap_addr,
            end_address: mmap_addr + memory_size,
        },
    };

    let identifier = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
        0xFF,
    ];
    let entry = MappingEntry {
        mapping,
        identifier,
    };

    let mut app_memory = AppMemoryList::default();
    app_memory.register(mmap_addr, 128);

    MinidumpWriter::new(pid, pid)
        .set_user_mapping_list(vec![entry])
        .set_app_memory(app_memory)
        .dump(&mut tmpfile)
        .expect("Couldn't write minidump");
    kill_and_reap(child);

    let dump = Minidump::read_path(tmpfile.path()).expect("Failed to read minidump");
    let module_list: MinidumpModuleList = dump
        .get_stream()
        .expect("Couldn't find stream MinidumpModuleList");
    let module = module_list
        .module_at_address(mmap_addr as u64)
        .expect("Couldn't find user mapping module");
    assert_eq!(module.base_address(), mmap_addr as u64);
    assert_eq!(module.size(), memory_size as u64);
    assert_eq!(module.code_file(), "a fake mapping");
    assert_eq!(
        module.debug_identifier(),
        Some("33221100554477668899AABBCCDDEEFF0".parse().unwrap())
    );

    // The user mapping is listed once
    assert_eq!(
        module_list
            .iter()
            .filter(|m| m.base_address() == mmap_addr as u64)
            .count(),
        1
    );

    let memory_list: MinidumpMemoryList<'_> =
        dump.get_stream().expect("Couldn't find MinidumpMemoryList");
    let region = memory_list
        .memory_at_address(mmap_addr as u64)
        .expect("app memory missing");
    assert_eq!(region.base_address, mmap_addr as u64);
    assert_eq!(region.size, 128);

    let _: MinidumpException = dump.get_stream().expect("Couldn't find MinidumpException");
    let _: MinidumpThreadList = dump.get_stream().expect("Couldn't find MinidumpThreadList");
    let _: MinidumpSystemInfo = dump.get_stream().expect("Couldn't find MinidumpSystemInfo");
    for stream in [
        LinuxCpuInfo,
        LinuxProcStatus,
        LinuxCmdLine,
        LinuxEnviron,
        LinuxAuxv,
        LinuxMaps,
        LinuxDsoDebug,
    ] {
        let raw = dump
            .get_raw_stream(stream as u32)
            .unwrap_or_else(|e| panic!("Couldn't find {stream:?}: {e}"));
        assert!(!raw.is_empty(), "{stream:?} is empty");
    }
}

#[test]
fn test_main_module_comes_first() {
    let child = start_child_and_wait_for_threads(1);
    let pid = child.id() as i32;

    let mut tmpfile = tempfile::Builder::new()
        .prefix("main_module")
        .tempfile()
        .unwrap();

    MinidumpWriter::new(pid, pid)
        .dump(&mut tmpfile)
        .expect("Couldn't write minidump");
    kill_and_reap(child);

    let dump = Minidump::read_path(tmpfile.path()).expect("Failed to read minidump");
    let module_list: MinidumpModuleList = dump.get_stream().expect("No module list");
    let main = module_list.main_module().expect("No main module");
    let helper = std::fs::canonicalize(env!("CARGO_BIN_EXE_test")).unwrap();
    assert_eq!(main.code_file(), helper.to_string_lossy());
    assert!(main.debug_identifier().is_some());
}

/// Stack sizes of every dumped thread, in dump order
fn stack_sizes(path: &std::path::Path) -> Vec<(u32, usize)> {
    let dump = Minidump::read_path(path).expect("Failed to read minidump");
    let threads: MinidumpThreadList = dump.get_stream().expect("No thread list");
    threads
        .threads
        .iter()
        .map(|t| (t.raw.thread_id, t.raw.stack.memory.data_size as usize))
        .collect()
}

#[test]
fn test_size_limit_caps_extra_threads() {
    let num_of_threads = 25;
    let child = start_child_and_wait_for_threads(num_of_threads);
    let pid = child.id() as i32;

    let mut unlimited = tempfile::Builder::new()
        .prefix("no_size_limit")
        .tempfile()
        .unwrap();
    let mut limited = tempfile::Builder::new()
        .prefix("size_limit")
        .tempfile()
        .unwrap();

    // The threads are parked, so both dumps see the same stacks
    MinidumpWriter::new(pid, pid)
        .dump(&mut unlimited)
        .expect("Couldn't write minidump");
    // Small enough that the estimate is exceeded right away
    MinidumpWriter::new(pid, pid)
        .set_minidump_size_limit(64 * 1024)
        .dump(&mut limited)
        .expect("Couldn't write minidump");
    kill_and_reap(child);

    let limits = StackLimits::default();
    let full = stack_sizes(unlimited.path());
    let capped = stack_sizes(limited.path());
    assert_eq!(full.len(), num_of_threads);
    assert_eq!(capped.len(), num_of_threads);

    for (idx, &(tid, size)) in capped.iter().enumerate() {
        let &(_, full_size) = full
            .iter()
            .find(|(t, _)| *t == tid)
            .unwrap_or_else(|| panic!("thread {tid} missing from the unlimited dump"));
        assert!(size > 0, "thread {idx} has no stack");
        if idx < limits.base_thread_count {
            assert_eq!(size, full_size, "base thread {idx} lost part of its stack");
        } else {
            assert_eq!(
                size,
                full_size.min(limits.max_extra_thread_stack_len),
                "thread {idx} has a {size} byte stack"
            );
        }
    }

    // The main thread's stack holds the environment and auxv, it is well
    // above the cap
    assert!(capped[0].1 > limits.max_extra_thread_stack_len);
}

#[test]
fn test_unlimited_dump_keeps_stacks() {
    let num_of_threads = 25;
    let child = start_child_and_wait_for_threads(num_of_threads);
    let pid = child.id() as i32;

    let mut tmpfile = tempfile::Builder::new()
        .prefix("no_size_limit")
        .tempfile()
        .unwrap();

    MinidumpWriter::new(pid, pid)
        .dump(&mut tmpfile)
        .expect("Couldn't write minidump");
    kill_and_reap(child);

    let dump = Minidump::read_path(tmpfile.path()).expect("Failed to read minidump");
    let threads: MinidumpThreadList = dump.get_stream().expect("No thread list");
    assert_eq!(threads.threads.len(), num_of_threads);
    assert!(threads.threads.iter().all(|t| t.raw.stack.memory.data_size > 0));
}

#[test]
fn test_sanitized_stacks_hide_data() {
    let child = start_child_and_wait_for_threads(1);
    let pid = child.id() as i32;

    let mut tmpfile = tempfile::Builder::new()
        .prefix("sanitized")
        .tempfile()
        .unwrap();

    MinidumpWriter::new(pid, pid)
        .sanitize_stack()
        .dump(&mut tmpfile)
        .expect("Couldn't write minidump");
    kill_and_reap(child);

    let dump = Minidump::read_path(tmpfile.path()).expect("Failed to read minidump");
    let threads: MinidumpThreadList = dump.get_stream().expect("No thread list");
    let memory_list: MinidumpMemoryList<'_> = dump.get_stream().expect("No memory list");
    let stack = memory_list
        .memory_at_address(threads.threads[0].raw.stack.start_of_memory_range)
        .expect("No stack memory");

    let defaced = DEFACED_VALUE.to_ne_bytes();
    assert!(stack.bytes.chunks_exact(defaced.len()).any(|w| w == defaced));
}

#[test]
fn test_unreferenced_principal_mapping_skips_the_dump() {
    let child = start_child_and_wait_for_threads(1);
    let pid = child.id() as i32;

    let mut tmpfile = tempfile::Builder::new()
        .prefix("principal_mapping")
        .tempfile()
        .unwrap();

    // Nothing points at an address that isn't mapped
    let result = MinidumpWriter::new(pid, pid)
        .skip_stacks_if_mapping_unreferenced(0x10)
        .dump(&mut tmpfile);
    kill_and_reap(child);

    assert!(matches!(
        result,
        Err(minidump_handler::errors::WriterError::PrincipalMappingNotReferenced)
    ));
}

#[test]
fn test_directory_round_trip() {
    use scroll::Pread;

    let num_of_threads = 3;
    let child = start_child_and_wait_for_threads(num_of_threads);
    let pid = child.id() as i32;

    let mut tmpfile = tempfile::Builder::new()
        .prefix("directory")
        .tempfile()
        .unwrap();

    MinidumpWriter::new(pid, pid)
        .dump(&mut tmpfile)
        .expect("Couldn't write minidump");
    kill_and_reap(child);

    let bytes = std::fs::read(tmpfile.path()).unwrap();
    let header: minidump_common::format::MINIDUMP_HEADER =
        bytes.pread_with(0, scroll::LE).unwrap();
    assert_eq!(header.signature, minidump_common::format::MINIDUMP_SIGNATURE);
    assert_eq!(header.stream_count, 13);

    let dump = Minidump::read(bytes.as_slice()).expect("Failed to parse");
    let mut offset = header.stream_directory_rva as usize;
    for _ in 0..header.stream_count {
        let entry: minidump_common::format::MINIDUMP_DIRECTORY =
            bytes.gread_with(&mut offset, scroll::LE).unwrap();
        if entry.stream_type == 0 {
            assert_eq!(entry.location.data_size, 0);
            assert_eq!(entry.location.rva, 0);
            continue;
        }
        let raw = dump.get_raw_stream(entry.stream_type).unwrap();
        assert_eq!(raw.len(), entry.location.data_size as usize);
        assert!(entry.location.rva as usize + raw.len() <= bytes.len());
    }

    // The lists start their entries right after the count
    let threads: MinidumpThreadList = dump.get_stream().expect("No thread list");
    assert_eq!(threads.threads.len(), num_of_threads);
    let tids: Vec<u32> = threads.threads.iter().map(|t| t.raw.thread_id).collect();
    assert!(tids.contains(&(pid as u32)), "{pid} missing from {tids:?}");
    assert!(tids.iter().all(|tid| *tid != 0));

    let memory_list: MinidumpMemoryList<'_> = dump.get_stream().expect("No memory list");
    for thread in &threads.threads {
        let stack = &thread.raw.stack;
        assert_ne!(stack.start_of_memory_range, 0);
        assert!(stack.memory.data_size > 0);
        let region = memory_list
            .memory_at_address(stack.start_of_memory_range)
            .unwrap_or_else(|| panic!("stack of {} not in the memory list", thread.raw.thread_id));
        assert_eq!(region.base_address, stack.start_of_memory_range);
        assert_eq!(region.size, stack.memory.data_size as u64);
    }

    let modules: MinidumpModuleList = dump.get_stream().expect("No module list");
    let main = modules.main_module().expect("No main module");
    let helper = std::fs::canonicalize(env!("CARGO_BIN_EXE_test")).unwrap();
    assert_eq!(main.code_file(), helper.to_string_lossy());
    for module in modules.iter() {
        assert_ne!(module.base_address(), 0, "{} has no base", module.code_file());
        assert!(module.size() > 0, "{} is empty", module.code_file());
    }
}
