//! Processor and operating system details for the system info stream

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86;
        pub use x86::write_cpu_information;
    } else if #[cfg(target_arch = "aarch64")] {
        mod arm;
        pub use arm::write_cpu_information;
    }
}

use {
    super::errors::CpuInfoError,
    crate::minidump_format::PlatformId,
    failspot::failspot,
    nix::sys::utsname::uname,
    std::{
        collections::BTreeSet,
        io::{BufRead, BufReader},
    },
};

type Result<T> = std::result::Result<T, CpuInfoError>;

/// Retrieves the [`PlatformId`] and the version string assembled from uname
pub fn os_information() -> nix::Result<(PlatformId, String)> {
    let info = uname()?;
    let vers = format!(
        "{} {} {} {}",
        info.sysname().to_string_lossy(),
        info.release().to_string_lossy(),
        info.version().to_string_lossy(),
        info.machine().to_string_lossy(),
    );

    Ok((
        if cfg!(target_os = "android") {
            PlatformId::Android
        } else {
            PlatformId::Linux
        },
        vers,
    ))
}

/// Calls `on_field` with every `<name> : <value>` pair of `/proc/cpuinfo`
///
/// Empty lines separate the processors, names may contain spaces and
/// values may be empty.
fn for_each_cpuinfo_field(mut on_field: impl FnMut(&str, &str)) -> Result<()> {
    const CPUINFO: &str = "/proc/cpuinfo";

    failspot!(CpuInfoFileOpen bail(CpuInfoError::IOError(
        CPUINFO.into(),
        std::io::ErrorKind::NotFound.into()
    )));

    let file =
        std::fs::File::open(CPUINFO).map_err(|e| CpuInfoError::IOError(CPUINFO.into(), e))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| CpuInfoError::IOError(CPUINFO.into(), e))?;
        if let Some((field, value)) = line.split_once(':') {
            on_field(field.trim(), value.trim());
        }
    }
    Ok(())
}

/// A set of CPU numbers in the sysfs list format, `0-3,8,10-11`
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CpuSet(BTreeSet<u32>);

impl CpuSet {
    pub fn parse(list: &str) -> Result<Self> {
        let mut set = BTreeSet::new();
        for item in list.trim().split(',').filter(|item| !item.is_empty()) {
            let invalid = || CpuInfoError::InvalidRange(list.to_owned());
            let (start, end) = match item.split_once('-') {
                Some((start, end)) => (
                    start.parse::<u32>().map_err(|_| invalid())?,
                    end.parse::<u32>().map_err(|_| invalid())?,
                ),
                None => {
                    let cpu = item.parse::<u32>().map_err(|_| invalid())?;
                    (cpu, cpu)
                }
            };
            if end < start {
                return Err(invalid());
            }
            set.extend(start..=end);
        }
        Ok(Self(set))
    }

    pub fn read(path: &str) -> Result<Self> {
        let list =
            std::fs::read_to_string(path).map_err(|e| CpuInfoError::IOError(path.into(), e))?;
        Self::parse(&list)
    }

    pub fn intersect_with(&mut self, other: &Self) {
        self.0.retain(|cpu| other.0.contains(cpu));
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }
}

/// The number of CPUs both present and possible, the count the kernel
/// reports in cpuinfo only covers online ones
#[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
fn present_cpu_count() -> Result<usize> {
    let mut present = CpuSet::read("/sys/devices/system/cpu/present")?;
    let possible = CpuSet::read("/sys/devices/system/cpu/possible")?;
    present.intersect_with(&possible);
    Ok(present.count())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_cpu_lists() {
        assert_eq!(CpuSet::parse("0-3\n").unwrap().count(), 4);
        assert_eq!(CpuSet::parse("0,2,4-5").unwrap().count(), 4);
        assert_eq!(CpuSet::parse("").unwrap().count(), 0);
        assert!(CpuSet::parse("3-1").is_err());
        assert!(CpuSet::parse("a-b").is_err());

        let mut present = CpuSet::parse("0-7").unwrap();
        present.intersect_with(&CpuSet::parse("2-3,6-15").unwrap());
        assert_eq!(present.count(), 4);
    }

    #[test]
    fn os_version_has_machine() {
        let (_, version) = os_information().unwrap();
        let machine = if cfg!(target_arch = "x86_64") {
            "x86_64"
        } else {
            "aarch64"
        };
        assert!(version.starts_with("Linux"), "{version}");
        assert!(version.ends_with(machine), "{version}");
    }
}
