//! Registration locator
//!
//! `CodeRegistration` and `MetadataRegistration` are plain globals whose
//! symbols are almost always stripped. The locator first tries symbols,
//! then scans readable memory for constants only the registration records
//! can hold (counts derived from the metadata), walks pointer
//! cross-references back to the record base, and scores every surviving
//! candidate by how much of the record dereferences into mapped memory.

use crate::registration::{
    read_code_registration, read_metadata_registration, COUNT_LIMIT,
};
use cildump_binary_parser::{BinaryFile, Region};
use cildump_core::{Address, BinaryFormat, Error, Result};
use tracing::{debug, info};

/// `mscorlib.dll\0`: present in every build, referenced by its code-gen
/// module, which in turn sits in the module table.
const FEATURE: &[u8] = b"mscorlib.dll\0";

/// How many pointers of a candidate table are sampled during validation
const SAMPLE: usize = 10;

/// Counts derived from the metadata that seed the scans
#[derive(Debug, Clone, Copy)]
pub struct SearchCounts {
    /// Methods with a global pointer index (pre-24.2 layouts)
    pub methods: usize,
    pub type_defs: usize,
    pub images: usize,
    pub usages: usize,
}

/// Locator result: both record addresses plus the version after
/// binary-side refinement.
#[derive(Debug, Clone, Copy)]
pub struct Located {
    pub code_registration: u64,
    pub metadata_registration: u64,
    pub version: f64,
}

/// Find both registration records, or fail with `RegistrationNotFound`.
pub fn locate(binary: &dyn BinaryFile, version: f64, counts: &SearchCounts) -> Result<Located> {
    if let Some(located) = symbol_search(binary, version) {
        info!(
            code = format_args!("{:#x}", located.code_registration),
            meta = format_args!("{:#x}", located.metadata_registration),
            "registration found via symbols"
        );
        return Ok(located);
    }

    let located = plus_search(binary, version, counts)?;
    info!(
        code = format_args!("{:#x}", located.code_registration),
        meta = format_args!("{:#x}", located.metadata_registration),
        version = located.version,
        "registration found via scan"
    );
    Ok(located)
}

// ========== Symbol search ==========

fn symbol_search(binary: &dyn BinaryFile, version: f64) -> Option<Located> {
    let find = |name: &str| -> Option<u64> {
        binary
            .symbols()
            .iter()
            .find(|s| s.name == name || s.name == format!("_{name}"))
            .map(|s| s.address.as_u64())
    };
    let code = find("g_CodeRegistration")?;
    let meta = find("g_MetadataRegistration")?;
    let version = refine_from_counts(binary, version, code);
    Some(Located {
        code_registration: code,
        metadata_registration: meta,
        version,
    })
}

/// Version-only refinement used when the base address is already exact
/// (symbols): sub-versions betray themselves through absurd counts.
fn refine_from_counts(binary: &dyn BinaryFile, version: f64, code_va: u64) -> f64 {
    let Ok(cr) = read_code_registration(binary, code_va, version) else {
        return version;
    };
    if version == 27.0 && cr.invoker_pointers_count.0 > COUNT_LIMIT {
        return 27.1;
    }
    if version == 24.4 && cr.invoker_pointers_count.0 > COUNT_LIMIT {
        return 24.5;
    }
    if version == 24.2 && cr.code_gen_modules.is_null() {
        return 24.3;
    }
    version
}

// ========== Plus search ==========

fn plus_search(binary: &dyn BinaryFile, version: f64, counts: &SearchCounts) -> Result<Located> {
    let data_regions = binary.data_regions();
    let exec_regions = binary.exec_regions();
    let bss_regions = binary.bss_regions();

    let (raw_candidates, pointer_in_exec) = if version >= 24.2 {
        // ELF images keep the module table in a mapped RX segment more
        // often than not; everything else keeps it in data.
        let exec_first = binary.format() == BinaryFormat::Elf;
        let (first, second) = if exec_first {
            (&exec_regions, &data_regions)
        } else {
            (&data_regions, &exec_regions)
        };
        let found = find_code_registration_2019(binary, version, counts.images, first, &data_regions);
        if found.is_empty() {
            let fallback =
                find_code_registration_2019(binary, version, counts.images, second, &data_regions);
            (fallback, !exec_first)
        } else {
            (found, exec_first)
        }
    } else {
        (
            find_code_registration_old(binary, counts.methods, &data_regions, &exec_regions),
            false,
        )
    };

    // Binary-side sub-version refinement shifts the base; score the
    // refined candidates.
    let mut best: Option<(u32, u64, f64)> = None;
    for raw in raw_candidates {
        let (adj_version, adj_va) = adjust_candidate(binary, version, raw);
        let Some(score) = score_code_registration(binary, adj_version, adj_va, counts) else {
            continue;
        };
        debug!(candidate = format_args!("{adj_va:#x}"), score, "code registration candidate");
        let better = match best {
            None => true,
            Some((best_score, best_va, _)) => {
                score > best_score || (score == best_score && adj_va < best_va)
            }
        };
        if better {
            best = Some((score, adj_va, adj_version));
        }
    }
    let (_, code_va, version) = best.ok_or(Error::RegistrationNotFound)?;

    let meta_candidates = find_metadata_registration(
        binary,
        version,
        counts,
        &data_regions,
        &exec_regions,
        &bss_regions,
        pointer_in_exec,
    );
    let mut best_meta: Option<(u32, u64)> = None;
    for candidate in meta_candidates {
        let Some(score) = score_metadata_registration(binary, version, candidate, counts) else {
            continue;
        };
        debug!(candidate = format_args!("{candidate:#x}"), score, "metadata registration candidate");
        let better = match best_meta {
            None => true,
            Some((best_score, best_va)) => {
                score > best_score || (score == best_score && candidate < best_va)
            }
        };
        if better {
            best_meta = Some((score, candidate));
        }
    }
    let (_, meta_va) = best_meta.ok_or(Error::RegistrationNotFound)?;

    Ok(Located {
        code_registration: code_va,
        metadata_registration: meta_va,
        version,
    })
}

/// Back off from the code-gen modules pointer field to the record base.
/// The field count depends on the (possibly forced) version.
fn module_field_backoff(version: f64) -> u64 {
    if version >= 29.1 {
        16
    } else if version >= 29.0 {
        14
    } else {
        13
    }
}

/// 24.2+ scan: find `mscorlib.dll`, its module record, the module table
/// entry pointing at that record, then the `[image count][table pointer]`
/// pair inside `CodeRegistration`.
fn find_code_registration_2019(
    binary: &dyn BinaryFile,
    version: f64,
    images_count: usize,
    scan_regions: &[Region],
    data_regions: &[Region],
) -> Vec<u64> {
    if images_count == 0 {
        return Vec::new();
    }
    let data = binary.data();
    let ptr = binary.pointer_size();
    let mut candidates = Vec::new();

    for region in scan_regions {
        let hay = match slice_region(data, region) {
            Some(hay) => hay,
            None => continue,
        };
        for idx in find_all(hay, FEATURE) {
            let dll_va = region.address + idx as u64;

            for (_, module_va) in find_refs(data, data_regions, ptr, dll_va) {
                for (_, entry_va) in find_refs(data, data_regions, ptr, module_va) {
                    if version >= 27.0 {
                        collect_v27_candidates(
                            binary,
                            version,
                            images_count,
                            entry_va,
                            data_regions,
                            &mut candidates,
                        );
                    } else {
                        for i in 0..images_count as u64 {
                            let Some(table_va) = entry_va.checked_sub(i * ptr as u64) else {
                                break;
                            };
                            for (_, field_va) in find_refs(data, data_regions, ptr, table_va) {
                                candidates
                                    .push(field_va.wrapping_sub(13 * ptr as u64));
                            }
                        }
                    }
                }
            }
        }
    }

    candidates.sort_unstable();
    candidates.dedup();
    candidates
}

fn collect_v27_candidates(
    binary: &dyn BinaryFile,
    version: f64,
    images_count: usize,
    entry_va: u64,
    data_regions: &[Region],
    candidates: &mut Vec<u64>,
) {
    let data = binary.data();
    let ptr = binary.pointer_size();
    let Some(min_target) = entry_va.checked_sub((images_count as u64 - 1) * ptr as u64) else {
        return;
    };
    let backoff = module_field_backoff(version) * ptr as u64;

    for region in data_regions {
        let Some(hay) = slice_region(data, region) else {
            continue;
        };
        let mut offset = 0usize;
        while offset + 2 * ptr <= hay.len() {
            if read_word(hay, offset, ptr) == images_count as u64 {
                let table_ptr = read_word(hay, offset + ptr, ptr);
                if (min_target..=entry_va).contains(&table_ptr)
                    && (entry_va - table_ptr) % ptr as u64 == 0
                    && (entry_va - table_ptr) / (ptr as u64) < images_count as u64
                {
                    let field_va = region.address + (offset + ptr) as u64;
                    candidates.push(field_va.wrapping_sub(backoff));
                }
            }
            offset += ptr;
        }
    }
}

/// Pre-24.2 scan: the record starts with `[method count][method pointer
/// table]`, and every entry of that table lands in executable memory.
fn find_code_registration_old(
    binary: &dyn BinaryFile,
    methods_count: usize,
    data_regions: &[Region],
    exec_regions: &[Region],
) -> Vec<u64> {
    if methods_count == 0 {
        return Vec::new();
    }
    let data = binary.data();
    let ptr = binary.pointer_size();
    let mut candidates = Vec::new();

    for region in data_regions {
        let Some(hay) = slice_region(data, region) else {
            continue;
        };
        let mut offset = 0usize;
        while offset + 2 * ptr <= hay.len() {
            if read_word(hay, offset, ptr) == methods_count as u64 {
                let table_va = read_word(hay, offset + ptr, ptr);
                if let Some(table_off) = binary.va_to_offset(Address::new(table_va)) {
                    if data_regions.iter().any(|r| r.contains_offset(table_off))
                        && pointers_land_in(data, table_off as usize, methods_count, ptr, exec_regions)
                    {
                        candidates.push(region.address + offset as u64);
                    }
                }
            }
            offset += ptr;
        }
    }

    candidates.sort_unstable();
    candidates.dedup();
    candidates
}

fn find_metadata_registration(
    binary: &dyn BinaryFile,
    version: f64,
    counts: &SearchCounts,
    data_regions: &[Region],
    exec_regions: &[Region],
    bss_regions: &[Region],
    pointer_in_exec: bool,
) -> Vec<u64> {
    if version < 19.0 || counts.type_defs == 0 {
        return Vec::new();
    }
    if version >= 27.0 {
        find_metadata_registration_v27(
            binary,
            counts.type_defs,
            data_regions,
            exec_regions,
            pointer_in_exec,
        )
    } else {
        find_metadata_registration_old(binary, counts, data_regions, bss_regions)
    }
}

/// v27+: `fieldOffsetsCount` and `typeDefinitionsSizesCount` both equal
/// the type-def count and sit two pointer fields apart; the sizes table
/// behind the next field must hold in-range pointers.
fn find_metadata_registration_v27(
    binary: &dyn BinaryFile,
    type_defs_count: usize,
    data_regions: &[Region],
    exec_regions: &[Region],
    pointer_in_exec: bool,
) -> Vec<u64> {
    let data = binary.data();
    let ptr = binary.pointer_size();
    let target_regions = if pointer_in_exec { exec_regions } else { data_regions };
    let mut candidates = Vec::new();

    for region in data_regions {
        let Some(hay) = slice_region(data, region) else {
            continue;
        };
        let mut offset = 0usize;
        while offset + 4 * ptr <= hay.len() {
            if read_word(hay, offset, ptr) == type_defs_count as u64
                && read_word(hay, offset + 2 * ptr, ptr) == type_defs_count as u64
            {
                let sizes_va = read_word(hay, offset + 3 * ptr, ptr);
                if let Some(sizes_off) = offset_in_regions(sizes_va, data_regions) {
                    let sample = SAMPLE.min(type_defs_count);
                    if pointers_land_in(data, sizes_off as usize, sample, ptr, target_regions) {
                        let va = region.address + offset as u64;
                        candidates.push(va.wrapping_sub(10 * ptr as u64));
                    }
                }
            }
            offset += ptr;
        }
    }

    candidates.sort_unstable();
    candidates.dedup();
    candidates
}

/// Pre-27: seek `typeDefinitionsSizesCount`, then require the usage slot
/// array three fields later to point into zero-fill (the runtime patches
/// those slots in live memory).
fn find_metadata_registration_old(
    binary: &dyn BinaryFile,
    counts: &SearchCounts,
    data_regions: &[Region],
    bss_regions: &[Region],
) -> Vec<u64> {
    let data = binary.data();
    let ptr = binary.pointer_size();
    let mut candidates = Vec::new();

    for region in data_regions {
        let Some(hay) = slice_region(data, region) else {
            continue;
        };
        let mut offset = 0usize;
        while offset + 4 * ptr <= hay.len() {
            if read_word(hay, offset, ptr) == counts.type_defs as u64 {
                let usages_va = read_word(hay, offset + 3 * ptr, ptr);
                let verified = match offset_in_regions(usages_va, data_regions) {
                    Some(usages_off) if counts.usages > 0 => pointers_land_in(
                        data,
                        usages_off as usize,
                        SAMPLE.min(counts.usages),
                        ptr,
                        bss_regions,
                    ),
                    _ => counts.usages == 0,
                };
                if verified {
                    let va = region.address + offset as u64;
                    candidates.push(va.wrapping_sub(12 * ptr as u64));
                }
            }
            offset += ptr;
        }
    }

    candidates.sort_unstable();
    candidates.dedup();
    candidates
}

// ========== Candidate refinement and scoring ==========

/// Binary-side sub-version detection. The scan's field backoff assumes
/// the base layout of the major version; newer tails show up as absurd
/// counts at the assumed offsets and shift the base.
fn adjust_candidate(binary: &dyn BinaryFile, version: f64, code_va: u64) -> (f64, u64) {
    if version < 24.2 {
        return (version, code_va);
    }
    let ptr = binary.pointer_size() as u64;
    let Ok(cr) = read_code_registration(binary, code_va, version) else {
        return (version, code_va);
    };

    if version == 31.0 && cr.generic_method_pointers_count.0 > COUNT_LIMIT {
        (31.0, code_va.wrapping_sub(ptr * 2))
    } else if version == 29.0 && cr.generic_method_pointers_count.0 > COUNT_LIMIT {
        (29.1, code_va.wrapping_sub(ptr * 2))
    } else if version == 27.0 && cr.reverse_pinvoke_wrapper_count.0 > COUNT_LIMIT {
        (27.1, code_va.wrapping_sub(ptr))
    } else if version == 24.4 {
        let code_va = code_va.wrapping_sub(ptr * 2);
        if cr.reverse_pinvoke_wrapper_count.0 > COUNT_LIMIT {
            (24.5, code_va.wrapping_sub(ptr))
        } else {
            (24.4, code_va)
        }
    } else if version == 24.2 && cr.interop_data_count.0 == 0 {
        (24.3, code_va.wrapping_sub(ptr * 2))
    } else {
        (version, code_va)
    }
}

/// A candidate survives only if every populated `(count, pointer)` pair
/// dereferences; the score is the number of populated pairs.
fn score_code_registration(
    binary: &dyn BinaryFile,
    version: f64,
    va: u64,
    counts: &SearchCounts,
) -> Option<u32> {
    let cr = read_code_registration(binary, va, version).ok()?;

    let mut pairs: Vec<(u64, u64)> = Vec::new();
    if version <= 24.1 {
        pairs.push((cr.method_pointers_count.0, cr.method_pointers.0));
    }
    if version >= 22.0 {
        pairs.push((cr.reverse_pinvoke_wrapper_count.0, cr.reverse_pinvoke_wrappers.0));
        pairs.push((cr.unresolved_virtual_call_count.0, cr.unresolved_virtual_call_pointers.0));
    }
    pairs.push((cr.generic_method_pointers_count.0, cr.generic_method_pointers.0));
    pairs.push((cr.invoker_pointers_count.0, cr.invoker_pointers.0));
    if version <= 24.5 {
        pairs.push((cr.custom_attribute_count.0, cr.custom_attribute_generators.0));
    }
    if version >= 23.0 {
        pairs.push((cr.interop_data_count.0, cr.interop_data.0));
    }
    if version >= 24.2 {
        if cr.code_gen_modules_count.count() != counts.images {
            return None;
        }
        pairs.push((cr.code_gen_modules_count.0, cr.code_gen_modules.0));
    }

    score_pairs(binary, &pairs)
}

fn score_metadata_registration(
    binary: &dyn BinaryFile,
    version: f64,
    va: u64,
    counts: &SearchCounts,
) -> Option<u32> {
    let mr = read_metadata_registration(binary, va, version).ok()?;
    if counts.type_defs > 0 && mr.field_offsets_count.count() != counts.type_defs {
        return None;
    }

    let pairs = [
        (mr.generic_classes_count.0, mr.generic_classes.0),
        (mr.generic_insts_count.0, mr.generic_insts.0),
        (mr.generic_method_table_count.0, mr.generic_method_table.0),
        (mr.types_count.0, mr.types.0),
        (mr.method_specs_count.0, mr.method_specs.0),
        (mr.field_offsets_count.0, mr.field_offsets.0),
        (mr.type_definitions_sizes_count.0, mr.type_definitions_sizes.0),
    ];
    score_pairs(binary, &pairs)
}

fn score_pairs(binary: &dyn BinaryFile, pairs: &[(u64, u64)]) -> Option<u32> {
    let mut score = 0;
    for &(count, pointer) in pairs {
        if count > COUNT_LIMIT * 16 {
            return None;
        }
        if count > 0 {
            if pointer == 0 || binary.va_to_offset(Address::new(pointer)).is_none() {
                return None;
            }
            score += 1;
        }
    }
    Some(score)
}

// ========== Scan primitives ==========

fn slice_region<'d>(data: &'d [u8], region: &Region) -> Option<&'d [u8]> {
    let start = region.offset as usize;
    let end = (region.offset_end as usize).min(data.len());
    (start < end).then(|| &data[start..end])
}

fn read_word(data: &[u8], offset: usize, ptr: usize) -> u64 {
    if ptr == 4 {
        u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as u64
    } else {
        u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
    }
}

fn find_all(hay: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return Vec::new();
    }
    hay.windows(needle.len())
        .enumerate()
        .filter_map(|(i, w)| (w == needle).then_some(i))
        .collect()
}

/// All pointer-aligned cells inside the data regions holding `value`,
/// as `(file offset, va)` pairs.
fn find_refs(data: &[u8], data_regions: &[Region], ptr: usize, value: u64) -> Vec<(usize, u64)> {
    let mut refs = Vec::new();
    for region in data_regions {
        let Some(hay) = slice_region(data, region) else {
            continue;
        };
        let mut offset = 0usize;
        while offset + ptr <= hay.len() {
            if read_word(hay, offset, ptr) == value {
                refs.push((
                    region.offset as usize + offset,
                    region.address + offset as u64,
                ));
            }
            offset += ptr;
        }
    }
    refs
}

fn offset_in_regions(va: u64, regions: &[Region]) -> Option<u64> {
    regions
        .iter()
        .find(|r| va >= r.address && va < r.address_end)
        .map(|r| r.offset + (va - r.address))
}

/// Read `count` pointers at `offset` and require every one inside the
/// given VA regions.
fn pointers_land_in(
    data: &[u8],
    offset: usize,
    count: usize,
    ptr: usize,
    regions: &[Region],
) -> bool {
    if offset + count * ptr > data.len() {
        return false;
    }
    (0..count).all(|i| {
        let value = read_word(data, offset + i * ptr, ptr);
        regions.iter().any(|r| r.contains_va(value))
    })
}
