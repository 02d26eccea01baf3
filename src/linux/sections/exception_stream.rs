use super::*;
use errors::SectionExceptionStreamError;

/// Records the signal and the thread it hit
///
/// Without a crash context this is a dump on request. The blamed thread's
/// instruction pointer stands in for the crash address then.
pub fn write(
    config: &MinidumpWriter,
    buffer: &mut DumpBuf,
) -> Result<MDRawDirectory, SectionExceptionStreamError> {
    let (thread_id, exception_code, exception_flags, exception_address) =
        match (&config.crash_context, &config.crashing_thread_context) {
            (Some(context), _) => (
                context.tid(),
                context.signal(),
                context.signal_code() as u32,
                context.fault_address(),
            ),
            (None, CrashingThreadContext::CrashContextPlusAddress((_, ip))) => (
                config.blamed_thread,
                MD_EXCEPTION_CODE_DUMP_REQUESTED,
                0,
                *ip as u64,
            ),
            (None, _) => (config.blamed_thread, MD_EXCEPTION_CODE_DUMP_REQUESTED, 0, 0),
        };

    let thread_context = match config.crashing_thread_context {
        CrashingThreadContext::CrashContext(location)
        | CrashingThreadContext::CrashContextPlusAddress((location, _)) => location,
        CrashingThreadContext::None => MDLocationDescriptor::default(),
    };

    let stream = MDRawExceptionStream {
        thread_id: thread_id as u32,
        __align: 0,
        exception_record: MDException {
            exception_code,
            exception_flags,
            exception_record: 0,
            exception_address,
            number_parameters: 0,
            __align: 0,
            exception_information: [0; 15],
        },
        thread_context,
    };
    let exc = MemoryWriter::alloc_with_val(buffer, stream)?;

    Ok(MDRawDirectory {
        stream_type: MDStreamType::ExceptionStream as u32,
        location: exc.location(),
    })
}
