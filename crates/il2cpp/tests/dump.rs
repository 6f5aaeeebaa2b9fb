//! End-to-end dump tests over synthetic fixtures
//!
//! Each fixture is a tiny but complete game image: a metadata blob with
//! three types (`<Module>`, `Game.Player`, `Game.Box<T>`), and a binary
//! whose data segment carries the full registration graph, including a
//! `Box<int>` instantiation. Records are serialized through the crate's
//! own schemas so the fixtures track the layouts exactly.

use cildump_core::DumpConfig;
use cildump_il2cpp::dump;
use cildump_il2cpp::stream::{encode_record, Ptr};
use cildump_il2cpp::structures::*;

// ============================================================
// Metadata fixture
// ============================================================

fn build_metadata(major: u32, version: f64) -> Vec<u8> {
    let mut strings = vec![0u8]; // index 0 is the empty string
    let mut intern = |s: &str| -> u32 {
        let at = strings.len() as u32;
        strings.extend_from_slice(s.as_bytes());
        strings.push(0);
        at
    };
    let s_mscorlib_dll = intern("mscorlib.dll");
    let s_module = intern("<Module>");
    let s_game = intern("Game");
    let s_player = intern("Player");
    let s_box = intern("Box`1");
    let s_t = intern("T");
    let s_health = intern("health");
    let s_box_field = intern("box");
    let s_value = intern("value");
    let s_ctor = intern(".ctor");
    let s_gethealth = intern("GetHealth");
    let s_amount = intern("amount");
    let s_mscorlib = intern("mscorlib");

    let literals = [
        Il2CppStringLiteral {
            length: 5,
            data_index: 0,
        },
        Il2CppStringLiteral {
            length: 0,
            data_index: 5,
        },
    ];
    let literal_data = b"hello";

    // Runtime type table indices (see build_payload):
    // 0 void, 1 int, 2 object, 3 Player, 4 <Module>, 5 Box`1,
    // 6 T (field use), 7 Box<int> (field use), 8 int (field use)
    let fields = [
        Il2CppFieldDefinition {
            name_index: s_health,
            type_index: 8,
            token: 0x04000001,
            ..Default::default()
        },
        Il2CppFieldDefinition {
            name_index: s_box_field,
            type_index: 7,
            token: 0x04000002,
            ..Default::default()
        },
        Il2CppFieldDefinition {
            name_index: s_value,
            type_index: 6,
            token: 0x04000003,
            ..Default::default()
        },
    ];

    let parameters = [Il2CppParameterDefinition {
        name_index: s_amount,
        token: 0x08000001,
        type_index: 1,
        ..Default::default()
    }];

    let methods = [
        Il2CppMethodDefinition {
            name_index: s_ctor,
            declaring_type: 1,
            return_type: 0,
            parameter_start: 0,
            generic_container_index: -1,
            token: 0x06000001,
            flags: 0x0006,
            slot: 0xFFFF,
            parameter_count: 0,
            ..Default::default()
        },
        Il2CppMethodDefinition {
            name_index: s_gethealth,
            declaring_type: 1,
            return_type: 1,
            parameter_start: 0,
            generic_container_index: -1,
            token: 0x06000002,
            flags: 0x0006,
            slot: 0xFFFF,
            parameter_count: 1,
            ..Default::default()
        },
    ];

    let no_members = |name: u32, namespace: u32, byval: i32, token: u32| Il2CppTypeDefinition {
        name_index: name,
        namespace_index: namespace,
        byval_type_index: byval,
        byref_type_index: byval,
        declaring_type_index: -1,
        parent_index: -1,
        element_type_index: -1,
        generic_container_index: -1,
        field_start: -1,
        method_start: -1,
        event_start: -1,
        property_start: -1,
        nested_types_start: -1,
        interfaces_start: -1,
        vtable_start: -1,
        interface_offsets_start: -1,
        token,
        ..Default::default()
    };

    let module_def = no_members(s_module, 0, 4, 0x02000001);

    let mut player_def = no_members(s_player, s_game, 3, 0x02000002);
    player_def.parent_index = 2;
    player_def.flags = type_attributes::PUBLIC;
    player_def.field_start = 0;
    player_def.field_count = 2;
    player_def.method_start = 0;
    player_def.method_count = 2;

    let mut box_def = no_members(s_box, s_game, 5, 0x02000003);
    box_def.parent_index = 2;
    box_def.flags = type_attributes::PUBLIC;
    box_def.generic_container_index = 0;
    box_def.field_start = 2;
    box_def.field_count = 1;

    let type_defs = [module_def, player_def, box_def];

    let images = [Il2CppImageDefinition {
        name_index: s_mscorlib_dll,
        assembly_index: 0,
        type_start: 0,
        type_count: 3,
        entry_point_index: -1,
        token: 1,
        ..Default::default()
    }];

    let assembly_head = Il2CppAssemblyDefinitionHead {
        image_index: 0,
        token: 1,
        ..Default::default()
    };
    let assembly_name = Il2CppAssemblyNameDefinition {
        name_index: s_mscorlib,
        ..Default::default()
    };

    let containers = [Il2CppGenericContainer {
        owner_index: 2,
        type_argc: 1,
        is_method: 0,
        generic_parameter_start: 0,
    }];
    let generic_params = [Il2CppGenericParameter {
        owner_index: 0,
        name_index: s_t,
        ..Default::default()
    }];

    // Assemble: header first, then the literal table (its offset doubles
    // as the header-length marker for the 24.x family), then the rest.
    let header_size = encode_record(&Il2CppGlobalMetadataHeader::default(), version, 8).len();
    let mut blob = vec![0u8; header_size];

    let place = |blob: &mut Vec<u8>, bytes: &[u8]| -> (u32, u32) {
        while blob.len() % 8 != 0 {
            blob.push(0);
        }
        let offset = blob.len() as u32;
        blob.extend_from_slice(bytes);
        (offset, bytes.len() as u32)
    };

    let literal_bytes: Vec<u8> = literals
        .iter()
        .flat_map(|r| encode_record(r, version, 8))
        .collect();
    let (string_literal_offset, string_literal_size) = place(&mut blob, &literal_bytes);
    let (string_literal_data_offset, string_literal_data_size) = place(&mut blob, literal_data);
    let (string_offset, string_size) = place(&mut blob, &strings);

    let field_bytes: Vec<u8> = fields
        .iter()
        .flat_map(|r| encode_record(r, version, 8))
        .collect();
    let (fields_offset, fields_size) = place(&mut blob, &field_bytes);

    let parameter_bytes: Vec<u8> = parameters
        .iter()
        .flat_map(|r| encode_record(r, version, 8))
        .collect();
    let (parameters_offset, parameters_size) = place(&mut blob, &parameter_bytes);

    let method_bytes: Vec<u8> = methods
        .iter()
        .flat_map(|r| encode_record(r, version, 8))
        .collect();
    let (methods_offset, methods_size) = place(&mut blob, &method_bytes);

    let type_def_bytes: Vec<u8> = type_defs
        .iter()
        .flat_map(|r| encode_record(r, version, 8))
        .collect();
    let (type_definitions_offset, type_definitions_size) = place(&mut blob, &type_def_bytes);

    let image_bytes: Vec<u8> = images
        .iter()
        .flat_map(|r| encode_record(r, version, 8))
        .collect();
    let (images_offset, images_size) = place(&mut blob, &image_bytes);

    let mut assembly_bytes = encode_record(&assembly_head, version, 8);
    assembly_bytes.extend_from_slice(&encode_record(&assembly_name, version, 8));
    let (assemblies_offset, assemblies_size) = place(&mut blob, &assembly_bytes);

    let container_bytes: Vec<u8> = containers
        .iter()
        .flat_map(|r| encode_record(r, version, 8))
        .collect();
    let (generic_containers_offset, generic_containers_size) = place(&mut blob, &container_bytes);

    let param_bytes: Vec<u8> = generic_params
        .iter()
        .flat_map(|r| encode_record(r, version, 8))
        .collect();
    let (generic_parameters_offset, generic_parameters_size) = place(&mut blob, &param_bytes);

    let header = Il2CppGlobalMetadataHeader {
        sanity: METADATA_MAGIC,
        version: major,
        string_literal_offset,
        string_literal_size,
        string_literal_data_offset,
        string_literal_data_size,
        string_offset,
        string_size,
        methods_offset,
        methods_size,
        parameters_offset,
        parameters_size,
        fields_offset,
        fields_size,
        generic_parameters_offset,
        generic_parameters_size,
        generic_containers_offset,
        generic_containers_size,
        type_definitions_offset,
        type_definitions_size,
        images_offset,
        images_size,
        assemblies_offset,
        assemblies_size,
        ..Default::default()
    };
    let header_bytes = encode_record(&header, version, 8);
    assert_eq!(header_bytes.len(), header_size);
    blob[..header_size].copy_from_slice(&header_bytes);
    blob
}

// ============================================================
// Registration payload (the binary's data segment)
// ============================================================

struct PayloadSpec {
    data_va: u64,
    ptr: usize,
    version: f64,
    method_vas: [u64; 2],
}

fn build_payload(spec: &PayloadSpec) -> Vec<u8> {
    let ptr = spec.ptr;
    let version = spec.version;

    let gc_size = encode_record(&Il2CppGenericClassRaw::default(), version, ptr).len();
    let cgm_size = encode_record(&Il2CppCodeGenModule::default(), version, ptr).len();
    let cr_size = encode_record(&Il2CppCodeRegistration::default(), version, ptr).len();
    let mr_size = encode_record(&Il2CppMetadataRegistration::default(), version, ptr).len();
    let tds_size = encode_record(&Il2CppTypeDefinitionSizes::default(), version, ptr).len();

    let type_stride = ((ptr + 4 + 7) / 8) * 8;
    let type_count = 9usize;

    let mut cursor = 0usize;
    let mut alloc = |size: usize| -> usize {
        cursor = (cursor + 7) & !7;
        let at = cursor;
        cursor += size;
        at
    };

    let name_off = alloc(13);
    let types_off = alloc(type_stride * type_count);
    let tp_off = alloc(ptr * type_count);
    let gc_off = alloc(gc_size);
    let gi_off = alloc(2 * ptr);
    let giargv_off = alloc(ptr);
    let gca_off = alloc(ptr);
    let gia_off = alloc(ptr);
    let mp_off = alloc(2 * ptr);
    let cgm_off = alloc(cgm_size);
    let cgma_off = alloc(ptr);
    let pfo_off = alloc(8);
    let bfo_off = alloc(4);
    let fo_off = alloc(3 * ptr);
    let tds_off = alloc(3 * tds_size);
    let tdsa_off = alloc(3 * ptr);
    let cr_off = alloc(cr_size);
    let mr_off = alloc(mr_size);
    let total = (cursor + 7) & !7;

    let va = |off: usize| spec.data_va + off as u64;
    let mut buf = vec![0u8; total];

    let put = |buf: &mut [u8], off: usize, bytes: &[u8]| {
        buf[off..off + bytes.len()].copy_from_slice(bytes);
    };
    let put_word = |buf: &mut [u8], off: usize, value: u64| {
        if ptr == 4 {
            buf[off..off + 4].copy_from_slice(&(value as u32).to_le_bytes());
        } else {
            buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
        }
    };

    put(&mut buf, name_off, b"mscorlib.dll\0");

    // (datapoint, bits): bits = attrs | tag << 16
    let type_entries: [(u64, u32); 9] = [
        (0, 0x01 << 16),                 // void
        (0, 0x08 << 16),                 // int
        (0, 0x1c << 16),                 // object
        (1, 0x12 << 16),                 // Player
        (0, 0x12 << 16),                 // <Module>
        (2, 0x12 << 16),                 // Box`1
        (0, (0x13 << 16) | 0x6),         // T as public field
        (va(gc_off), (0x15 << 16) | 0x6), // Box<int> as public field
        (0, (0x08 << 16) | 0x6),         // int as public field
    ];
    for (i, &(datapoint, bits)) in type_entries.iter().enumerate() {
        let at = types_off + i * type_stride;
        put_word(&mut buf, at, datapoint);
        put(&mut buf, at + ptr, &bits.to_le_bytes());
    }
    for i in 0..type_count {
        put_word(&mut buf, tp_off + i * ptr, va(types_off + i * type_stride));
    }

    let gc = Il2CppGenericClassRaw {
        type_definition_index: Ptr(2),
        type_ptr: Ptr(va(types_off + 5 * type_stride)),
        class_inst: Ptr(va(gi_off)),
        ..Default::default()
    };
    put(&mut buf, gc_off, &encode_record(&gc, version, ptr));

    put_word(&mut buf, gi_off, 1);
    put_word(&mut buf, gi_off + ptr, va(giargv_off));
    put_word(&mut buf, giargv_off, va(types_off + type_stride)); // int
    put_word(&mut buf, gca_off, va(gc_off));
    put_word(&mut buf, gia_off, va(gi_off));

    put_word(&mut buf, mp_off, spec.method_vas[0]);
    put_word(&mut buf, mp_off + ptr, spec.method_vas[1]);

    let cgm = Il2CppCodeGenModule {
        module_name: Ptr(va(name_off)),
        method_pointer_count: Ptr(2),
        method_pointers: Ptr(va(mp_off)),
        ..Default::default()
    };
    put(&mut buf, cgm_off, &encode_record(&cgm, version, ptr));
    put_word(&mut buf, cgma_off, va(cgm_off));

    put(&mut buf, pfo_off, &0x10u32.to_le_bytes());
    put(&mut buf, pfo_off + 4, &0x18u32.to_le_bytes());
    put(&mut buf, bfo_off, &0x10u32.to_le_bytes());
    put_word(&mut buf, fo_off, 0);
    put_word(&mut buf, fo_off + ptr, va(pfo_off));
    put_word(&mut buf, fo_off + 2 * ptr, va(bfo_off));

    for i in 0..3 {
        put_word(&mut buf, tdsa_off + i * ptr, va(tds_off + i * tds_size));
    }

    // Pre-29 layouts: a populated reverse-pinvoke pointer is what the
    // 27.x base-shift heuristic keys on.
    let reverse_pinvoke = if (27.0..29.0).contains(&version) {
        (Ptr(1), Ptr(va(mp_off)))
    } else {
        (Ptr(0), Ptr(0))
    };
    let cr = Il2CppCodeRegistration {
        reverse_pinvoke_wrapper_count: reverse_pinvoke.0,
        reverse_pinvoke_wrappers: reverse_pinvoke.1,
        interop_data_count: Ptr(1),
        interop_data: Ptr(va(tds_off)),
        code_gen_modules_count: Ptr(1),
        code_gen_modules: Ptr(va(cgma_off)),
        ..Default::default()
    };
    put(&mut buf, cr_off, &encode_record(&cr, version, ptr));

    let mr = Il2CppMetadataRegistration {
        generic_classes_count: Ptr(1),
        generic_classes: Ptr(va(gca_off)),
        generic_insts_count: Ptr(1),
        generic_insts: Ptr(va(gia_off)),
        types_count: Ptr(type_count as u64),
        types: Ptr(va(tp_off)),
        field_offsets_count: Ptr(3),
        field_offsets: Ptr(va(fo_off)),
        type_definitions_sizes_count: Ptr(3),
        type_definitions_sizes: Ptr(va(tdsa_off)),
        ..Default::default()
    };
    put(&mut buf, mr_off, &encode_record(&mr, version, ptr));

    buf
}

// ============================================================
// Container builders
// ============================================================

fn build_elf64(exec: &[u8], exec_va: u64, data_seg: &[u8], data_va: u64) -> Vec<u8> {
    let phoff = 64u64;
    let phentsize = 56u16;
    let phnum = 2u16;
    let exec_off = phoff + phentsize as u64 * phnum as u64;
    let data_off = exec_off + exec.len() as u64;

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&3u16.to_le_bytes());
    out.extend_from_slice(&183u16.to_le_bytes()); // EM_AARCH64
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&exec_va.to_le_bytes());
    out.extend_from_slice(&phoff.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&phentsize.to_le_bytes());
    out.extend_from_slice(&phnum.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    let phdr = |out: &mut Vec<u8>, flags: u32, off: u64, va: u64, size: u64| {
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&off.to_le_bytes());
        out.extend_from_slice(&va.to_le_bytes());
        out.extend_from_slice(&va.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());
    };
    phdr(&mut out, 0x5, exec_off, exec_va, exec.len() as u64); // R+X
    phdr(&mut out, 0x6, data_off, data_va, data_seg.len() as u64); // R+W

    out.extend_from_slice(exec);
    out.extend_from_slice(data_seg);
    out
}

fn build_pe64(image_base: u64, text: &[u8], text_rva: u32, data_seg: &[u8], data_rva: u32) -> Vec<u8> {
    let pe_offset = 0x80u32;
    let opt_size = 112u16 + 16 * 8;
    let mut out = vec![0u8; pe_offset as usize];
    out[0] = b'M';
    out[1] = b'Z';
    out[0x3C..0x40].copy_from_slice(&pe_offset.to_le_bytes());

    out.extend_from_slice(&0x00004550u32.to_le_bytes());
    out.extend_from_slice(&0x8664u16.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&opt_size.to_le_bytes());
    out.extend_from_slice(&0x22u16.to_le_bytes());

    out.extend_from_slice(&0x20Bu16.to_le_bytes());
    out.extend_from_slice(&[14, 0]);
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&text_rva.to_le_bytes());
    out.extend_from_slice(&text_rva.to_le_bytes());
    out.extend_from_slice(&image_base.to_le_bytes());
    out.extend_from_slice(&0x1000u32.to_le_bytes());
    out.extend_from_slice(&0x200u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&0x4000u32.to_le_bytes());
    out.extend_from_slice(&0x400u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&[2, 0, 0, 0]);
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 16 * 8]);

    let text_off = 0x400u32;
    let data_off = text_off + text.len() as u32;
    let shdr = |out: &mut Vec<u8>, name: &[u8; 8], vsize: u32, rva: u32, rsize: u32, off: u32, ch: u32| {
        out.extend_from_slice(name);
        out.extend_from_slice(&vsize.to_le_bytes());
        out.extend_from_slice(&rva.to_le_bytes());
        out.extend_from_slice(&rsize.to_le_bytes());
        out.extend_from_slice(&off.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(&ch.to_le_bytes());
    };
    shdr(
        &mut out,
        b".text\0\0\0",
        text.len() as u32,
        text_rva,
        text.len() as u32,
        text_off,
        0x60000000 | 0x00000020, // read | execute | code
    );
    shdr(
        &mut out,
        b".data\0\0\0",
        data_seg.len() as u32,
        data_rva,
        data_seg.len() as u32,
        data_off,
        0xC0000000 | 0x00000040, // read | write | initialized
    );

    out.resize(text_off as usize, 0);
    out.extend_from_slice(text);
    out.extend_from_slice(data_seg);
    out
}

fn build_nso(text: &[u8], rodata: &[u8], data_seg: &[u8], bss_size: u32) -> Vec<u8> {
    let c_text = lz4_flex::block::compress(text);
    let c_rodata = lz4_flex::block::compress(rodata);
    let c_data = lz4_flex::block::compress(data_seg);

    let text_mem = 0u32;
    let rodata_mem = text.len() as u32;
    let data_mem = rodata_mem + rodata.len() as u32;

    let header_len = 0x100u32;
    let text_off = header_len;
    let rodata_off = text_off + c_text.len() as u32;
    let data_off = rodata_off + c_rodata.len() as u32;

    let mut out = vec![0u8; header_len as usize];
    out[0..4].copy_from_slice(&0x304F534Eu32.to_le_bytes());
    out[12..16].copy_from_slice(&7u32.to_le_bytes());
    out[16..20].copy_from_slice(&text_off.to_le_bytes());
    out[20..24].copy_from_slice(&text_mem.to_le_bytes());
    out[24..28].copy_from_slice(&(text.len() as u32).to_le_bytes());
    out[32..36].copy_from_slice(&rodata_off.to_le_bytes());
    out[36..40].copy_from_slice(&rodata_mem.to_le_bytes());
    out[40..44].copy_from_slice(&(rodata.len() as u32).to_le_bytes());
    out[48..52].copy_from_slice(&data_off.to_le_bytes());
    out[52..56].copy_from_slice(&data_mem.to_le_bytes());
    out[56..60].copy_from_slice(&(data_seg.len() as u32).to_le_bytes());
    out[60..64].copy_from_slice(&bss_size.to_le_bytes());
    out[0x60..0x64].copy_from_slice(&(c_text.len() as u32).to_le_bytes());
    out[0x64..0x68].copy_from_slice(&(c_rodata.len() as u32).to_le_bytes());
    out[0x68..0x6C].copy_from_slice(&(c_data.len() as u32).to_le_bytes());

    out.extend_from_slice(&c_text);
    out.extend_from_slice(&c_rodata);
    out.extend_from_slice(&c_data);
    out
}

fn uleb(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn sleb(mut v: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        let sign = byte & 0x40 != 0;
        if (v == 0 && !sign) || (v == -1 && sign) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn build_wasm(code: &[u8], data_seg: &[u8], linear_offset: i64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0x6D736100u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());

    out.push(10); // code section
    uleb(code.len() as u64, &mut out);
    out.extend_from_slice(code);

    let mut body = Vec::new();
    uleb(1, &mut body);
    uleb(0, &mut body);
    body.push(0x41); // i32.const
    sleb(linear_offset, &mut body);
    body.push(0x0B); // end
    uleb(data_seg.len() as u64, &mut body);
    body.extend_from_slice(data_seg);

    out.push(11); // data section
    uleb(body.len() as u64, &mut out);
    out.extend_from_slice(&body);
    out
}

// ============================================================
// Assertions shared by the scenarios
// ============================================================

fn artifact_str<'a>(artifacts: &'a std::collections::BTreeMap<String, Vec<u8>>, name: &str) -> &'a str {
    std::str::from_utf8(artifacts.get(name).expect(name)).unwrap()
}

fn assert_common_output(artifacts: &std::collections::BTreeMap<String, Vec<u8>>) {
    let dump_cs = artifact_str(artifacts, "dump.cs");
    assert!(dump_cs.starts_with("// Image 0: mscorlib.dll - 0\n"), "image header missing");
    assert!(dump_cs.contains("class <Module> // TypeDefIndex: 0"));
    assert!(dump_cs.contains("public class Player // TypeDefIndex: 1"));
    assert!(dump_cs.contains("public class Box<T> // TypeDefIndex: 2"));
    assert!(dump_cs.contains("public int health; // 0x10"));
    // the instantiated generic resolves to its argument, not to T
    assert!(dump_cs.contains("public Box<int> box; // 0x18"));
    assert!(dump_cs.contains("public T value; // 0x10"));
    assert!(dump_cs.contains("public int GetHealth(int amount) { }"));
    assert!(!dump_cs.contains("Box<T> box"));

    let header = artifact_str(artifacts, "il2cpp.h");
    assert!(header.contains("struct Game_Player_o;"));
    assert!(header.contains("typedef struct Game_Player_o {"));
    assert!(header.contains("int32_t health; // 0x10"));

    let script: serde_json::Value =
        serde_json::from_slice(artifacts.get("script.json").unwrap()).unwrap();
    let methods = script["ScriptMethod"].as_array().unwrap();
    assert_eq!(methods.len(), 2);
    let addr0 = methods[0]["Address"].as_u64().unwrap();
    let addr1 = methods[1]["Address"].as_u64().unwrap();
    assert!(addr0 < addr1, "method records must ascend by address");
    assert_eq!(methods[1]["Name"], "GetHealth");
    assert_eq!(methods[1]["TypeSignature"], "Game.Player");
    assert_eq!(methods[1]["Signature"], "int GetHealth(int amount)");

    let literals: serde_json::Value =
        serde_json::from_slice(artifacts.get("stringliteral.json").unwrap()).unwrap();
    assert_eq!(literals[0]["index"], 0);
    assert_eq!(literals[0]["length"], 5);
    assert_eq!(literals[0]["value"], "hello");
}

// ============================================================
// Scenarios
// ============================================================

#[test]
fn elf64_v29_end_to_end() {
    let metadata = build_metadata(29, 29.0);
    let payload = build_payload(&PayloadSpec {
        data_va: 0x20000,
        ptr: 8,
        version: 29.0,
        method_vas: [0x10020, 0x10060],
    });
    let exec = vec![0xD5u8; 0x100];
    let binary = build_elf64(&exec, 0x10000, &payload, 0x20000);

    let config = DumpConfig::default();
    let artifacts = dump(&binary, &metadata, &config).unwrap();
    assert_common_output(&artifacts);

    // ELF addresses are VAs; both methods live in the exec segment
    let dump_cs = artifact_str(&artifacts, "dump.cs");
    assert!(dump_cs.contains("VA: 0x10020"));
    assert!(dump_cs.contains("VA: 0x10060"));

    // determinism: a second run is byte-identical
    let again = dump(&binary, &metadata, &config).unwrap();
    assert_eq!(artifacts, again);
}

#[test]
fn pe_v27_end_to_end() {
    let image_base = 0x180000000u64;
    let metadata = build_metadata(27, 27.0);
    let payload = build_payload(&PayloadSpec {
        data_va: image_base + 0x2000,
        ptr: 8,
        version: 27.0,
        method_vas: [image_base + 0x1020, image_base + 0x1060],
    });
    let text = vec![0xCCu8; 0x200];
    let binary = build_pe64(image_base, &text, 0x1000, &payload, 0x2000);

    let artifacts = dump(&binary, &metadata, &DumpConfig::default()).unwrap();
    assert_common_output(&artifacts);

    // the first type block in the listing is <Module>
    let dump_cs = artifact_str(&artifacts, "dump.cs");
    let module_at = dump_cs.find("class <Module>").unwrap();
    let player_at = dump_cs.find("class Player").unwrap();
    assert!(module_at < player_at);

    // PE reports RVAs relative to the image base
    let script: serde_json::Value =
        serde_json::from_slice(artifacts.get("script.json").unwrap()).unwrap();
    assert_eq!(script["ScriptMethod"][0]["Address"], 0x1020);
}

#[test]
fn nso_v24_end_to_end() {
    // metadata says 24 and refines to 24.2; the registration layout is
    // 24.3, detected from the zero interop slot at the shifted offset
    let metadata = build_metadata(24, 24.2);
    let text = vec![0x1Fu8; 0x100];
    let payload = build_payload(&PayloadSpec {
        data_va: 0x100,
        ptr: 8,
        version: 24.3,
        method_vas: [0x20, 0x60],
    });
    let binary = build_nso(&text, &payload, &[0u8; 0x40], 0x40);

    let artifacts = dump(&binary, &metadata, &DumpConfig::default()).unwrap();
    assert_common_output(&artifacts);

    let dump_cs = artifact_str(&artifacts, "dump.cs");
    assert!(dump_cs.contains("VA: 0x20"));
}

#[test]
fn wasm_v24_end_to_end() {
    // code section content starts at file offset 10 (8-byte preamble,
    // 1-byte id, 1-byte size); pointers are 4 bytes wide
    let metadata = build_metadata(24, 24.2);
    let payload = build_payload(&PayloadSpec {
        data_va: 0x8000,
        ptr: 4,
        version: 24.2,
        method_vas: [10 + 0x10, 10 + 0x20],
    });
    let code = vec![0x0Bu8; 0x40];
    let binary = build_wasm(&code, &payload, 0x8000);

    let artifacts = dump(&binary, &metadata, &DumpConfig::default()).unwrap();
    assert_common_output(&artifacts);

    // script addresses are WASM linear/file addresses, not host VAs
    let script: serde_json::Value =
        serde_json::from_slice(artifacts.get("script.json").unwrap()).unwrap();
    assert_eq!(script["ScriptMethod"][0]["Address"], 10 + 0x10);
}

#[test]
fn forced_29_1_uses_the_16_field_backoff() {
    // binary-side registration encoded with the 29.1 tail; the metadata
    // still says 29.0, so only the forced version finds the base
    let metadata = build_metadata(29, 29.0);
    let payload = build_payload(&PayloadSpec {
        data_va: 0x20000,
        ptr: 8,
        version: 29.1,
        method_vas: [0x10020, 0x10060],
    });
    let exec = vec![0xD5u8; 0x100];
    let binary = build_elf64(&exec, 0x10000, &payload, 0x20000);

    let config = DumpConfig {
        force_il2cpp_version: Some(29.1),
        ..Default::default()
    };
    let artifacts = dump(&binary, &metadata, &config).unwrap();
    assert_common_output(&artifacts);
}

#[test]
fn missing_feature_string_fails_with_registration_not_found() {
    let metadata = build_metadata(29, 29.0);
    let mut payload = build_payload(&PayloadSpec {
        data_va: 0x20000,
        ptr: 8,
        version: 29.0,
        method_vas: [0x10020, 0x10060],
    });
    // corrupt the mscorlib.dll marker
    let at = payload
        .windows(12)
        .position(|w| w == b"mscorlib.dll")
        .unwrap();
    payload[at] = b'X';
    let binary = build_elf64(&[0u8; 0x100], 0x10000, &payload, 0x20000);

    let err = dump(&binary, &metadata, &DumpConfig::default()).unwrap_err();
    assert!(matches!(err, cildump_core::Error::RegistrationNotFound));
}

#[test]
fn disabled_script_generation_skips_json_artifacts() {
    let metadata = build_metadata(29, 29.0);
    let payload = build_payload(&PayloadSpec {
        data_va: 0x20000,
        ptr: 8,
        version: 29.0,
        method_vas: [0x10020, 0x10060],
    });
    let binary = build_elf64(&[0u8; 0x100], 0x10000, &payload, 0x20000);

    let config = DumpConfig {
        generate_script: false,
        ..Default::default()
    };
    let artifacts = dump(&binary, &metadata, &config).unwrap();
    assert!(artifacts.contains_key("dump.cs"));
    assert!(artifacts.contains_key("il2cpp.h"));
    assert!(!artifacts.contains_key("script.json"));
    assert!(!artifacts.contains_key("stringliteral.json"));
}
