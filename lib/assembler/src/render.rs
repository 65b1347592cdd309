//! Renders a laid-out [`Program`] to the bytes of a statically linked ELF32 executable.

use syntax::ast::Endianness;

use std::collections::HashMap;

use crate::error::AssemblyError;
use crate::extensions::RenderContext;
use crate::model::{Element, Program, Segment};

/// Size of the ELF32 file header.
pub const FILE_HEADER_SIZE: u64 = 52;
/// Size of a single ELF32 program header table entry.
pub const PROGRAM_HEADER_ENTRY_SIZE: u64 = 32;

/// `PT_LOAD`.
const PT_LOAD: u32 = 1;
/// `ET_EXEC`.
const ET_EXEC: u16 = 2;

/// The name given to the synthetic header segment [`insert_header_segment`] prepends.
pub const HEADER_SEGMENT_NAME: &str = "__header__";

/// Returns the combined size of the file header and the program header table for `program`.
///
/// The layout engine needs this value before it can place the first segment, since the header
/// occupies the start of the file.
#[must_use]
pub fn header_size(program: &Program) -> u64 {
    FILE_HEADER_SIZE + PROGRAM_HEADER_ENTRY_SIZE * program.segments.len() as u64
}

/// Prepends a synthetic `__header__` segment to `program`, holding the ELF file header and the
/// program header table as opaque file content.
///
/// Used for `--header-segment` output: the header gets its own `PT_LOAD` entry instead of
/// sharing one with the first user segment. Must run before [`crate::layout::layout`], which
/// should then be called with a `header_size` of `0` — the synthetic segment's own
/// `content_size` already accounts for the space the header and table occupy.
///
/// The header segment counts itself in `e_phnum`, so its size includes one extra program
/// header table entry beyond the `program.segments.len()` user segments that existed before it
/// was inserted.
pub fn insert_header_segment(program: &mut Program) {
    let entry_count = program.segments.len() as u64 + 1;
    let content_size = FILE_HEADER_SIZE + PROGRAM_HEADER_ENTRY_SIZE * entry_count;
    program.segments.insert(
        0,
        Segment {
            name: HEADER_SEGMENT_NAME.to_owned(),
            flags: 0x4,
            align: program.metadata.align,
            min_size: 0,
            elements: Vec::new(),
            labels: HashMap::new(),
            content_size,
            tail_reserved: 0,
            location_in_file: None,
            location_in_memory: None,
            is_header: true,
        },
    );
}

/// Renders `program` to a complete ELF32 executable image.
///
/// Every segment's `location_in_file` and `location_in_memory` must already be set, i.e.
/// [`crate::layout::layout`] must have run.
///
/// # Errors
///
/// Returns [`AssemblyError::MissingEntryLabel`] if the entry label is undefined,
/// [`AssemblyError::UndefinedLabel`] or [`AssemblyError::WrongSegment`] if a reference cannot be
/// resolved, [`AssemblyError::DisplacementOutOfRange`] if a relative reference's displacement
/// doesn't fit its declared width, [`AssemblyError::NumberOutOfRange`] if a numeric literal
/// doesn't fit its declared width, or whatever an extension's own `render` returns.
pub fn render(program: &Program) -> Result<Vec<u8>, AssemblyError> {
    let mut output = Vec::with_capacity(header_size(program) as usize);
    output.extend(render_file_header(program)?);
    output.extend(render_program_headers(program));
    output.extend(render_body(program)?);
    Ok(output)
}

/// Renders just the concatenated segment contents, with no ELF header or program header table.
///
/// Used for `--no-header` output: a caller that wants the raw bytes must have already laid
/// `program` out with a `header_size` of `0`.
///
/// # Errors
///
/// Same as [`render`].
pub fn render_body(program: &Program) -> Result<Vec<u8>, AssemblyError> {
    let mut output = Vec::new();
    for segment in &program.segments {
        output.extend(render_segment(program, segment)?);
    }
    Ok(output)
}

fn render_file_header(program: &Program) -> Result<Vec<u8>, AssemblyError> {
    let endianness = program.metadata.endianness;
    let mut header = Vec::with_capacity(FILE_HEADER_SIZE as usize);

    header.extend([0x7f, b'E', b'L', b'F']);
    header.push(1); // ei_class: ELFCLASS32
    header.push(if matches!(endianness, Endianness::Big) { 2 } else { 1 }); // ei_data
    header.push(1); // ei_version
    header.push(0); // ei_osabi
    header.push(0); // ei_abiversion
    header.extend([0u8; 7]); // padding

    let entry = program.entry_point()?;
    header.extend(pack(i128::from(ET_EXEC), 2, endianness));
    header.extend(pack(i128::from(program.metadata.machine), 2, endianness));
    header.extend(pack(1, 4, endianness)); // e_version
    header.extend(pack(i128::from(entry), 4, endianness)); // e_entry
    header.extend(pack(i128::from(FILE_HEADER_SIZE), 4, endianness)); // e_phoff
    header.extend(pack(0, 4, endianness)); // e_shoff
    header.extend(pack(0, 4, endianness)); // e_flags
    header.extend(pack(i128::from(FILE_HEADER_SIZE), 2, endianness)); // e_ehsize
    header.extend(pack(i128::from(PROGRAM_HEADER_ENTRY_SIZE), 2, endianness)); // e_phentsize
    header.extend(pack(program.segments.len() as i128, 2, endianness)); // e_phnum
    header.extend(pack(0, 2, endianness)); // e_shentsize
    header.extend(pack(0, 2, endianness)); // e_shnum
    header.extend(pack(0, 2, endianness)); // e_shstrndx

    Ok(header)
}

fn render_program_headers(program: &Program) -> Vec<u8> {
    let endianness = program.metadata.endianness;
    let mut headers = Vec::with_capacity(PROGRAM_HEADER_ENTRY_SIZE as usize * program.segments.len());
    for segment in &program.segments {
        let file_offset = segment.location_in_file.expect("layout must run before render");
        let address = segment.location_in_memory.expect("layout must run before render");

        headers.extend(pack(i128::from(PT_LOAD), 4, endianness)); // p_type
        headers.extend(pack(i128::from(file_offset), 4, endianness)); // p_offset
        headers.extend(pack(i128::from(address), 4, endianness)); // p_vaddr
        headers.extend(pack(i128::from(address), 4, endianness)); // p_paddr
        headers.extend(pack(i128::from(segment.file_size()), 4, endianness)); // p_filesz
        headers.extend(pack(i128::from(segment.memory_size()), 4, endianness)); // p_memsz
        headers.extend(pack(i128::from(segment.flags), 4, endianness)); // p_flags
        headers.extend(pack(i128::from(segment.align), 4, endianness)); // p_align
    }
    headers
}

fn render_segment(program: &Program, segment: &Segment) -> Result<Vec<u8>, AssemblyError> {
    if segment.is_header {
        let mut output = render_file_header(program)?;
        output.extend(render_program_headers(program));
        return Ok(output);
    }

    let endianness = program.metadata.endianness;
    let mut output = Vec::with_capacity(segment.content_size as usize);
    for element in &segment.elements {
        match element {
            Element::Byte(value) => output.push(*value),
            Element::Bytes(bytes) => output.extend(bytes),
            Element::Number { value, width, signed } => {
                if !fits_range(*value, *width, *signed) {
                    return Err(AssemblyError::NumberOutOfRange {
                        value: *value,
                        width: *width,
                    });
                }
                output.extend(pack(*value, *width, endianness));
            }
            Element::RelativeRef {
                target,
                width,
                offset_in_segment,
            } => {
                let target_offset = resolve_relative_target(program, segment, target)?;
                let displacement =
                    i128::from(target_offset) - i128::from(*offset_in_segment) - i128::from(*width);
                if !fits_signed(displacement, *width) {
                    return Err(AssemblyError::DisplacementOutOfRange {
                        value: displacement as i64,
                        width: *width,
                    });
                }
                output.extend(pack(displacement, *width, endianness));
            }
            Element::AbsoluteRef {
                target,
                segment: target_segment,
                offset,
            } => {
                let address = program
                    .label_address(target, target_segment.as_deref())
                    .ok_or_else(|| AssemblyError::UndefinedLabel {
                        segment: target_segment.clone(),
                        label: target.clone(),
                    })?;
                let value = i128::from(address) + i128::from(*offset);
                output.extend(pack(value, 4, endianness));
            }
            Element::Extension(payload) => {
                let ctx = RenderContext {
                    program,
                    segment: &segment.name,
                };
                output.extend(payload.render(&ctx)?);
            }
        }
    }
    Ok(output)
}

fn resolve_relative_target(program: &Program, segment: &Segment, target: &str) -> Result<u64, AssemblyError> {
    if let Some(offset) = segment.labels.get(target) {
        return Ok(*offset);
    }
    if let Some(other) = program.segment_defining(target, &segment.name) {
        return Err(AssemblyError::WrongSegment {
            label: format!("{other}:{target}"),
        });
    }
    Err(AssemblyError::UndefinedLabel {
        segment: Some(segment.name.clone()),
        label: target.to_owned(),
    })
}

fn fits_signed(value: i128, width: u8) -> bool {
    let bits = u32::from(width) * 8;
    if bits >= 127 {
        return true;
    }
    let min = -(1i128 << (bits - 1));
    let max = (1i128 << (bits - 1)) - 1;
    value >= min && value <= max
}

/// Whether a number literal's `value` fits in `width` bytes, signed or unsigned as declared.
fn fits_range(value: i128, width: u8, signed: bool) -> bool {
    let bits = u32::from(width) * 8;
    if bits >= 127 {
        return true;
    }
    if signed {
        fits_signed(value, width)
    } else {
        value >= 0 && value <= (1i128 << bits) - 1
    }
}

/// Packs `value`'s low `width` bytes in `endianness`, truncating as two's complement.
fn pack(value: i128, width: u8, endianness: Endianness) -> Vec<u8> {
    let full = value.to_le_bytes();
    let width = usize::from(width).min(full.len());
    let mut bytes = full[..width].to_vec();
    if matches!(endianness, Endianness::Big) {
        bytes.reverse();
    }
    bytes
}
