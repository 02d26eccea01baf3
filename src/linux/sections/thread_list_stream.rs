use super::*;
use crate::{
    linux::{crash_context::CpuContext, minidump_writer::StackLimits},
    minidump_cpu::RawContextCPU,
};
use error_graph::WriteErrorList;
use errors::SectionThreadListError;

/// How much memory around the instruction pointer of the crashing thread is
/// captured, half of it on either side
const IP_MEMORY_SIZE: usize = 256;

type Result<T> = std::result::Result<T, SectionThreadListError>;

/// Writes the thread list, capturing the stack and registers of every
/// suspended thread
///
/// The crashing thread takes its registers from the crash context, the
/// ptrace view of it would show the signal handler. A thread whose
/// registers can't be read still gets a record, with an empty stack and
/// context.
pub fn write(
    config: &mut MinidumpWriter,
    buffer: &mut DumpBuf,
    dumper: &impl Dumper,
    mut soft_errors: impl WriteErrorList<SectionThreadListError>,
) -> Result<MDRawDirectory> {
    let threads = dumper.threads().to_vec();
    let num_threads = threads.len();

    // <num_threads><thread_1><thread_2>...
    let list_header = MemoryWriter::<u32>::alloc_with_val(buffer, num_threads.try_into()?)?;

    let mut dirent = MDRawDirectory {
        stream_type: MDStreamType::ThreadListStream as u32,
        location: list_header.location(),
    };

    let mut thread_list = MemoryArrayWriter::<MDRawThread>::alloc_array(buffer, num_threads)?;
    dirent.location.data_size += thread_list.location().data_size;

    let limits = config.stack_limits;
    let extra_thread_stack_len = extra_thread_stack_len(
        config.minidump_size_limit,
        &limits,
        buffer.position(),
        num_threads,
    );

    let crash_context = config
        .crash_context
        .clone()
        .filter(|_| !dumper.is_post_mortem());

    for (idx, &tid) in threads.iter().enumerate() {
        let mut thread = MDRawThread {
            thread_id: tid.try_into()?,
            suspend_count: 0,
            priority_class: 0,
            priority: 0,
            teb: 0,
            stack: MDMemoryDescriptor::default(),
            thread_context: MDLocationDescriptor::default(),
        };

        if let Some(context) = crash_context.as_ref().filter(|c| c.tid() == tid) {
            fill_thread_stack(config, buffer, dumper, &mut thread, context, None, &mut soft_errors)?;

            // The code around the crash address helps when the crash is in
            // code no symbols exist for
            let ip = context.get_instruction_pointer();
            if let Some(ip_block) = write_instruction_memory(buffer, dumper, tid, ip, &mut soft_errors)? {
                config.memory_blocks.push(ip_block);
            }

            let mut cpu = RawContextCPU::default();
            context.fill_cpu_context(&mut cpu);
            let cpu_section = MemoryWriter::<RawContextCPU>::alloc_with_val(buffer, cpu)?;
            thread.thread_context = cpu_section.location();
            config.crashing_thread_context =
                CrashingThreadContext::CrashContext(cpu_section.location());
        } else {
            let info = match dumper.get_thread_info_by_index(idx) {
                Ok(info) => info,
                Err(e) => {
                    soft_errors.push(SectionThreadListError::ThreadInfoFailed(tid, e));
                    thread.stack.memory.rva = buffer.position().try_into()?;
                    thread_list.set_value_at(buffer, thread, idx)?;
                    continue;
                }
            };

            let max_stack_len = if idx >= limits.base_thread_count {
                extra_thread_stack_len
            } else {
                None
            };
            fill_thread_stack(
                config,
                buffer,
                dumper,
                &mut thread,
                &info,
                max_stack_len,
                &mut soft_errors,
            )?;

            let mut cpu = RawContextCPU::default();
            info.fill_cpu_context(&mut cpu);
            let cpu_section = MemoryWriter::<RawContextCPU>::alloc_with_val(buffer, cpu)?;
            thread.thread_context = cpu_section.location();

            // A dump requested without a crash context blames this thread,
            // its current position stands in for the crash address
            if tid == config.blamed_thread && config.crash_context.is_none() {
                config.crashing_thread_context = CrashingThreadContext::CrashContextPlusAddress((
                    cpu_section.location(),
                    info.get_instruction_pointer(),
                ));
            }
        }
        thread_list.set_value_at(buffer, thread, idx)?;
    }
    Ok(dirent)
}

/// Decides the stack cap of the threads past the base count
///
/// Most of a minidump is stack memory, so if the estimate of the stacks at
/// their average size would break the size limit the extra threads are
/// capped.
fn extra_thread_stack_len(
    minidump_size_limit: Option<u64>,
    limits: &StackLimits,
    position: u64,
    num_threads: usize,
) -> Option<usize> {
    let limit = minidump_size_limit?;
    let estimated_total_stack_size = (num_threads * limits.average_stack_len) as u64;
    let estimated_minidump_size =
        position + estimated_total_stack_size + limits.fudge_factor as u64;
    (estimated_minidump_size > limit).then_some(limits.max_extra_thread_stack_len)
}

/// Captures the stack of `thread`, leaving it empty if it can't be read or
/// doesn't qualify for the dump
fn fill_thread_stack(
    config: &mut MinidumpWriter,
    buffer: &mut DumpBuf,
    dumper: &impl Dumper,
    thread: &mut MDRawThread,
    context: &impl CpuContext,
    max_stack_len: Option<usize>,
    soft_errors: &mut impl WriteErrorList<SectionThreadListError>,
) -> Result<()> {
    let tid = thread.thread_id as Pid;
    let pc = context.get_instruction_pointer();
    let stack_pointer = context.get_stack_pointer();

    thread.stack.start_of_memory_range = stack_pointer as u64;
    thread.stack.memory.data_size = 0;
    thread.stack.memory.rva = buffer.position().try_into()?;

    let (mut stack, mut stack_len) = match dumper.get_stack_info(stack_pointer) {
        Ok(info) => info,
        Err(e) => {
            soft_errors.push(SectionThreadListError::StackCaptureFailed(tid, e));
            return Ok(());
        }
    };

    if let Some(max) = max_stack_len.filter(|max| *max > 0) {
        if stack_len > max {
            stack_len = max;
            // Skip whole chunks until the stack pointer is in range
            while stack + max < stack_pointer {
                stack += max;
            }
        }
    }

    let stack_bytes = match dumper.copy_from_process(tid, stack, stack_len) {
        Ok(bytes) => bytes,
        Err(e) => {
            soft_errors.push(SectionThreadListError::StackCaptureFailed(tid, e));
            return Ok(());
        }
    };
    let stack_pointer_offset = stack_pointer.saturating_sub(stack);

    if config.skip_stacks_if_mapping_unreferenced {
        let Some(principal_mapping) = &config.principal_mapping else {
            return Ok(());
        };
        let low_addr = principal_mapping.system_mapping_info.start_address;
        let high_addr = principal_mapping.system_mapping_info.end_address;
        if (pc < low_addr || pc > high_addr)
            && !principal_mapping.stack_has_pointer_to_mapping(stack_bytes, stack_pointer_offset)
        {
            return Ok(());
        }
    }

    if config.sanitize_stack {
        dumper.sanitize_stack_copy(stack_bytes, stack_pointer, stack_pointer_offset);
    }

    let section = MemoryArrayWriter::write_bytes(buffer, stack_bytes)?;
    thread.stack = MDMemoryDescriptor {
        start_of_memory_range: stack as u64,
        memory: section.location(),
    };
    config.memory_blocks.push(thread.stack);
    Ok(())
}

/// Copies the memory around `ip`, clamped to the mapping it's in
fn write_instruction_memory(
    buffer: &mut DumpBuf,
    dumper: &impl Dumper,
    tid: Pid,
    ip: usize,
    soft_errors: &mut impl WriteErrorList<SectionThreadListError>,
) -> Result<Option<MDMemoryDescriptor>> {
    let Some(mapping) = dumper.find_mapping_no_bias(ip) else {
        return Ok(None);
    };

    let start = mapping
        .system_mapping_info
        .start_address
        .max(ip.saturating_sub(IP_MEMORY_SIZE / 2));
    let end = mapping
        .system_mapping_info
        .end_address
        .min(ip.saturating_add(IP_MEMORY_SIZE / 2));
    if end <= start {
        return Ok(None);
    }

    let bytes = match dumper.copy_from_process(tid, start, end - start) {
        Ok(bytes) => bytes,
        Err(e) => {
            soft_errors.push(SectionThreadListError::InstructionMemoryFailed(tid, e));
            return Ok(None);
        }
    };

    let section = MemoryArrayWriter::write_bytes(buffer, bytes)?;
    Ok(Some(MDMemoryDescriptor {
        start_of_memory_range: start as u64,
        memory: section.location(),
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extra_threads_are_capped_only_over_the_limit() {
        let limits = StackLimits::default();

        assert_eq!(extra_thread_stack_len(None, &limits, 0, 1000), None);

        // 10 threads at 8KiB plus 64KiB of slack fit in 1MiB
        assert_eq!(
            extra_thread_stack_len(Some(1024 * 1024), &limits, 4096, 10),
            None
        );

        // 200 of them don't
        assert_eq!(
            extra_thread_stack_len(Some(1024 * 1024), &limits, 4096, 200),
            Some(limits.max_extra_thread_stack_len)
        );
    }

    #[test]
    fn custom_limits_are_used() {
        let limits = StackLimits {
            average_stack_len: 1024,
            base_thread_count: 2,
            max_extra_thread_stack_len: 512,
            fudge_factor: 0,
        };

        assert_eq!(extra_thread_stack_len(Some(4096), &limits, 0, 4), None);
        assert_eq!(extra_thread_stack_len(Some(4096), &limits, 1, 4), Some(512));
    }
}
