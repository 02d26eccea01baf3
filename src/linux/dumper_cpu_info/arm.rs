use {
    super::{Result, for_each_cpuinfo_field, present_cpu_count},
    crate::minidump_format::*,
};

/// Maps the `Features` names of `/proc/cpuinfo` onto the hwcap bits of the
/// ARM CPU_INFORMATION variant
const HWCAP_NAMES: &[(&str, MDCPUInformationARMElfHwCaps)] = &[
    ("swp", MDCPUInformationARMElfHwCaps::HWCAP_SWP),
    ("half", MDCPUInformationARMElfHwCaps::HWCAP_HALF),
    ("thumb", MDCPUInformationARMElfHwCaps::HWCAP_THUMB),
    ("26bit", MDCPUInformationARMElfHwCaps::HWCAP_26BIT),
    ("fastmult", MDCPUInformationARMElfHwCaps::HWCAP_FAST_MULT),
    ("fpa", MDCPUInformationARMElfHwCaps::HWCAP_FPA),
    ("vfp", MDCPUInformationARMElfHwCaps::HWCAP_VFP),
    ("edsp", MDCPUInformationARMElfHwCaps::HWCAP_EDSP),
    ("java", MDCPUInformationARMElfHwCaps::HWCAP_JAVA),
    ("iwmmxt", MDCPUInformationARMElfHwCaps::HWCAP_IWMMXT),
    ("crunch", MDCPUInformationARMElfHwCaps::HWCAP_CRUNCH),
    ("thumbee", MDCPUInformationARMElfHwCaps::HWCAP_THUMBEE),
    ("neon", MDCPUInformationARMElfHwCaps::HWCAP_NEON),
    ("vfpv3", MDCPUInformationARMElfHwCaps::HWCAP_VFPv3),
    ("vfpv3d16", MDCPUInformationARMElfHwCaps::HWCAP_VFPv3D16),
    ("tls", MDCPUInformationARMElfHwCaps::HWCAP_TLS),
    ("vfpv4", MDCPUInformationARMElfHwCaps::HWCAP_VFPv4),
    ("idiva", MDCPUInformationARMElfHwCaps::HWCAP_IDIVA),
    ("idivt", MDCPUInformationARMElfHwCaps::HWCAP_IDIVT),
];

/// Parses numbers the way cpuinfo prints them, hex with a `0x` prefix or
/// plain decimal
fn parse_number(value: &str) -> Option<u32> {
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Fills in the processor fields of `sys_info` from `/proc/cpuinfo` and the
/// sysfs CPU lists
pub fn write_cpu_information(sys_info: &mut MDRawSystemInfo) -> Result<()> {
    // processor_architecture should always be set, do this first
    sys_info.processor_architecture = MDCPUArchitecture::PROCESSOR_ARCHITECTURE_ARM64_OLD as u16;

    // The main id register layout, implementer[31:24] variant[23:20]
    // part[15:4] revision[3:0]
    let mut cpuid = 0u32;
    let mut hwcaps = 0u32;
    let mut architecture = None;
    let mut online = 0usize;

    for_each_cpuinfo_field(|field, value| {
        let (shift, mask) = match field {
            "processor" => {
                online += 1;
                return;
            }
            "CPU implementer" => (24, 0xff),
            "CPU variant" => (20, 0xf),
            "CPU part" => (4, 0xfff),
            "CPU revision" => (0, 0xf),
            // Reported as e.g. "8" or "AArch64", only the numeric form is
            // a processor level
            "CPU architecture" => {
                if architecture.is_none() {
                    architecture = parse_number(value);
                }
                return;
            }
            "Features" => {
                for feature in value.split_whitespace() {
                    if let Some((_, cap)) = HWCAP_NAMES.iter().find(|(name, _)| *name == feature)
                    {
                        hwcaps |= cap.bits();
                    }
                }
                return;
            }
            _ => return,
        };

        if let Some(number) = parse_number(value) {
            cpuid &= !(mask << shift);
            cpuid |= (number & mask) << shift;
        }
    })?;

    sys_info.processor_level = architecture.unwrap_or(8) as u16;

    let count = match present_cpu_count() {
        Ok(count) if count > 0 => count,
        Ok(_) => online,
        Err(e) => {
            log::warn!("falling back to cpuinfo for the processor count: {e}");
            online
        }
    };
    sys_info.number_of_processors = count.min(u8::MAX as usize) as u8;

    sys_info.cpu.data[..4].copy_from_slice(&cpuid.to_le_bytes());
    sys_info.cpu.data[4..8].copy_from_slice(&hwcaps.to_le_bytes());

    Ok(())
}
