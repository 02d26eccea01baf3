use super::*;
use crate::linux::maps_reader::MappingInfo;
use error_graph::WriteErrorList;
use errors::SectionMappingsError;

/// Write information about the mappings in effect
///
/// The module list is limited to what minidump consumers need to find
/// symbols, the full maps go in their own stream. Modules described by the
/// embedder replace the mappings they overlap.
pub fn write(
    config: &MinidumpWriter,
    buffer: &mut DumpBuf,
    dumper: &impl Dumper,
    mut soft_errors: impl WriteErrorList<SectionMappingsError>,
) -> Result<MDRawDirectory, SectionMappingsError> {
    let is_listed = |mapping: &MappingInfo| {
        mapping.is_eligible_for_module() && !mapping.overlaps_user_mapping(&config.user_mapping_list)
    };
    let num_output_mappings = dumper.mappings().iter().filter(|m| is_listed(m)).count()
        + config.user_mapping_list.len();

    let list_header =
        MemoryWriter::<u32>::alloc_with_val(buffer, num_output_mappings.try_into()?)?;

    let mut dirent = MDRawDirectory {
        stream_type: MDStreamType::ModuleListStream as u32,
        location: list_header.location(),
    };

    // In case of num_output_mappings == 0, this call doesn't allocate any memory in the buffer
    let mut mapping_list =
        MemoryArrayWriter::<MDRawModule>::alloc_array(buffer, num_output_mappings)?;
    dirent.location.data_size += mapping_list.location().data_size;

    // First write all the mappings from the dumper
    let mut idx = 0;
    for mapping in dumper.mappings().iter().filter(|m| is_listed(m)) {
        let identifier = match dumper.elf_identifier_for_mapping(mapping) {
            Ok(id) => id.0,
            Err(e) => {
                soft_errors.push(SectionMappingsError::IdentifierFailed(
                    mapping.name.clone().unwrap_or_default(),
                    e,
                ));
                Vec::new()
            }
        };

        let name = match dumper.get_mapping_effective_path_and_name(mapping) {
            Ok((path, _)) => path,
            Err(_) => mapping.name.clone().unwrap_or_default(),
        };

        let module = fill_raw_module(buffer, mapping, &name.to_string_lossy(), &identifier)?;
        mapping_list.set_value_at(buffer, module, idx)?;
        idx += 1;
    }

    // Next write all the mappings provided by the caller
    for user in &config.user_mapping_list {
        let name = user
            .mapping
            .name
            .as_deref()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        // GUID was provided by caller.
        let module = fill_raw_module(buffer, &user.mapping, &name, &user.identifier)?;
        mapping_list.set_value_at(buffer, module, idx)?;
        idx += 1;
    }
    Ok(dirent)
}

fn fill_raw_module(
    buffer: &mut DumpBuf,
    mapping: &MappingInfo,
    name: &str,
    identifier: &[u8],
) -> Result<MDRawModule, SectionMappingsError> {
    let cv_record = if identifier.is_empty() {
        // Just zeroes
        MDLocationDescriptor::default()
    } else {
        let mut record = MD_CVINFOELF_SIGNATURE.to_le_bytes().to_vec();
        record.extend_from_slice(identifier);
        MemoryArrayWriter::write_bytes(buffer, &record)?.location()
    };

    let name_header = write_string_to_location(buffer, name)?;

    Ok(MDRawModule {
        base_of_image: mapping.start_address as u64,
        size_of_image: mapping.size.try_into()?,
        cv_record,
        module_name_rva: name_header.rva,
        ..Default::default()
    })
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::linux::maps_reader::{MMPermissions, MappingEntry, SystemMappingInfo},
        scroll::Pread,
    };

    fn mapping(start_address: usize, size: usize, name: &str) -> MappingInfo {
        MappingInfo {
            start_address,
            size,
            system_mapping_info: SystemMappingInfo {
                start_address,
                end_address: start_address + size,
            },
            offset: 0,
            permissions: MMPermissions::READ | MMPermissions::EXECUTE,
            name: Some(name.into()),
        }
    }

    #[test]
    fn raw_module_has_cv_record_and_name() {
        let mut buffer = DumpBuf::with_capacity(0);
        let map = mapping(0x40_0000, 0x2000, "/usr/lib/libfoo.so");
        let identifier = [0xab; 20];

        let module = fill_raw_module(&mut buffer, &map, "/usr/lib/libfoo.so", &identifier).unwrap();
        assert_eq!(module.base_of_image, 0x40_0000);
        assert_eq!(module.size_of_image, 0x2000);

        // The full build id follows the signature
        assert_eq!(module.cv_record.data_size as usize, 4 + identifier.len());
        let rva = module.cv_record.rva as usize;
        let signature: u32 = buffer.pread_with(rva, scroll::LE).unwrap();
        assert_eq!(signature, MD_CVINFOELF_SIGNATURE);
        assert_eq!(&buffer[rva + 4..rva + 4 + identifier.len()], &identifier);

        // The name is a length prefixed UTF-16 string
        let name_len: u32 = buffer
            .pread_with(module.module_name_rva as usize, scroll::LE)
            .unwrap();
        assert_eq!(name_len as usize, "/usr/lib/libfoo.so".len() * 2);
    }

    #[test]
    fn empty_identifier_has_no_cv_record() {
        let mut buffer = DumpBuf::with_capacity(0);
        let map = mapping(0x40_0000, 0x1000, "libbar.so");

        let module = fill_raw_module(&mut buffer, &map, "libbar.so", &[]).unwrap();
        assert_eq!(module.cv_record.data_size, 0);
        assert_eq!(module.cv_record.rva, 0);
    }

    #[test]
    fn user_mappings_hide_what_they_overlap() {
        let user = vec![MappingEntry {
            mapping: mapping(0x40_0000, 0x4000, "libuser.so"),
            identifier: [1; 16],
        }];

        assert!(mapping(0x40_1000, 0x1000, "libinner.so").overlaps_user_mapping(&user));
        assert!(mapping(0x40_3000, 0x2000, "libstraddle.so").overlaps_user_mapping(&user));
        assert!(!mapping(0x40_4000, 0x2000, "libnext.so").overlaps_user_mapping(&user));
    }
}
