use {
    super::{Result, for_each_cpuinfo_field},
    crate::{errors::CpuInfoError, minidump_format::*},
};

const VENDOR_ID_LEN: usize = 12;

/// Fills in the processor fields of `sys_info` from `/proc/cpuinfo`
pub fn write_cpu_information(sys_info: &mut MDRawSystemInfo) -> Result<()> {
    // processor_architecture should always be set, do this first
    sys_info.processor_architecture = MDCPUArchitecture::PROCESSOR_ARCHITECTURE_AMD64 as u16;

    let mut processor_count = 0usize;
    let mut family = None;
    let mut model = None;
    let mut stepping = None;
    let mut vendor_id = None;

    for_each_cpuinfo_field(|field, value| {
        let parse = || value.parse::<u32>().ok();
        match field {
            "processor" => processor_count += 1,
            // Only the first processor's values are recorded
            "cpu family" if family.is_none() => family = parse(),
            "model" if model.is_none() => model = parse(),
            "stepping" if stepping.is_none() => stepping = parse(),
            "vendor_id" if vendor_id.is_none() && !value.is_empty() => {
                vendor_id = Some(value.to_owned());
            }
            _ => {}
        }
    })?;

    let (Some(family), Some(model), Some(stepping)) = (family, model, stepping) else {
        return Err(CpuInfoError::NotAllProcEntriesFound);
    };

    sys_info.processor_level = family as u16;
    sys_info.processor_revision = ((model << 8) | stepping) as u16;
    sys_info.number_of_processors = processor_count.min(u8::MAX as usize) as u8;

    // The vendor id is the first field of the x86 CPU_INFORMATION variant,
    // a 12 byte string without terminator
    if let Some(vendor_id) = vendor_id {
        let vendor_id = vendor_id.as_bytes();
        let len = vendor_id.len().min(VENDOR_ID_LEN);
        sys_info.cpu.data[..len].copy_from_slice(&vendor_id[..len]);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_this_machine() {
        // SAFETY: a plain repr(C) struct of integers
        let mut info: MDRawSystemInfo = unsafe { std::mem::zeroed() };
        write_cpu_information(&mut info).unwrap();
        assert_eq!(
            info.processor_architecture,
            MDCPUArchitecture::PROCESSOR_ARCHITECTURE_AMD64 as u16
        );
        assert!(info.number_of_processors > 0);
        assert!(info.cpu.data[..VENDOR_ID_LEN].iter().any(|b| *b != 0));
    }
}
