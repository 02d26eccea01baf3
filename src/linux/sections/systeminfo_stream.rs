use super::*;
use crate::linux::dumper_cpu_info as dci;
use error_graph::WriteErrorList;
use errors::SectionSystemInfoError;

/// Describes the processor and the kernel
///
/// Missing details are soft errors, the stream is always written.
pub fn write(
    buffer: &mut DumpBuf,
    mut soft_errors: impl WriteErrorList<SectionSystemInfoError>,
) -> Result<MDRawDirectory, SectionSystemInfoError> {
    let mut info_section = MemoryWriter::<MDRawSystemInfo>::alloc(buffer)?;
    let dirent = MDRawDirectory {
        stream_type: MDStreamType::SystemInfoStream as u32,
        location: info_section.location(),
    };

    // SAFETY: POD
    let mut info = unsafe { std::mem::zeroed::<MDRawSystemInfo>() };

    match dci::os_information() {
        Ok((platform_id, os_version)) => {
            info.platform_id = platform_id as u32;
            let os_version_loc = write_string_to_location(buffer, &os_version)?;
            info.csd_version_rva = os_version_loc.rva;
        }
        Err(e) => {
            info.platform_id = PlatformId::Linux as u32;
            soft_errors.push(SectionSystemInfoError::UnameFailed(e));
        }
    }

    if let Err(e) = dci::write_cpu_information(&mut info) {
        soft_errors.push(SectionSystemInfoError::CpuInfoError(e));
    }

    info_section.set_value(buffer, info)?;
    Ok(dirent)
}

#[cfg(test)]
mod test {
    use {super::*, error_graph::ErrorList, scroll::Pread};

    #[test]
    fn describes_this_machine() {
        let mut buffer = DumpBuf::with_capacity(0);
        let mut soft_errors = ErrorList::<errors::WriterError>::default();
        let dirent = write(
            &mut buffer,
            soft_errors.subwriter(errors::WriterError::WriteSystemInfoErrors),
        )
        .unwrap();
        assert!(soft_errors.is_empty(), "{soft_errors:?}");

        assert_eq!(dirent.stream_type, MDStreamType::SystemInfoStream as u32);
        let info: MDRawSystemInfo = buffer
            .pread_with(dirent.location.rva as usize, scroll::LE)
            .unwrap();

        assert!(info.number_of_processors > 0);
        assert_ne!(info.csd_version_rva, 0);
        #[cfg(target_arch = "x86_64")]
        assert_eq!(
            info.processor_architecture,
            MDCPUArchitecture::PROCESSOR_ARCHITECTURE_AMD64 as u16
        );
    }
}
