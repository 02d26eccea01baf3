use super::*;
use error_graph::WriteErrorList;
use errors::SectionAppMemoryError;

/// Write application-provided memory regions.
///
/// The regions go into the memory list, they have no stream of their own.
/// A region that can't be read is left out.
pub fn write(
    config: &mut MinidumpWriter,
    buffer: &mut DumpBuf,
    dumper: &impl Dumper,
    mut soft_errors: impl WriteErrorList<SectionAppMemoryError>,
) -> Result<(), SectionAppMemoryError> {
    for app_memory in &config.app_memory {
        let data_copy =
            match dumper.copy_from_process(config.blamed_thread, app_memory.ptr, app_memory.length)
            {
                Ok(data) => data,
                Err(source) => {
                    soft_errors.push(SectionAppMemoryError::CopyFailed {
                        address: app_memory.ptr,
                        source,
                    });
                    continue;
                }
            };

        let section = MemoryArrayWriter::write_bytes(buffer, data_copy)?;
        let desc = MDMemoryDescriptor {
            start_of_memory_range: app_memory.ptr as u64,
            memory: section.location(),
        };
        config.memory_blocks.push(desc);
    }
    Ok(())
}
