//! Turns a preprocessed [`syntax::ast::File`] (no includes, no fragments, no fragment
//! references left) into a [`Program`].

use std::collections::HashMap;

use syntax::ast::{self, Item, Node};

use crate::error::AssemblyError;
use crate::extensions::ExtensionRegistry;
use crate::model::{Element, Program, ResolvedMetadata, Segment};

/// Transforms a preprocessed file into a [`Program`] with `entry_label` as its entry point.
///
/// # Errors
///
/// Returns an [`AssemblyError`] if a label is defined twice in one segment, a `$name` fragment
/// variable survived preprocessing, or an extension payload fails to parse. Numeric literal
/// range checking happens later, at render time.
pub fn transform(
    file: ast::File,
    entry_label: impl Into<String>,
    extensions: &ExtensionRegistry,
) -> Result<Program, AssemblyError> {
    let metadata = file.metadata.ok_or_else(|| AssemblyError::MetadataMismatch {
        message: "no program declaration".to_owned(),
    })?;
    let metadata = ResolvedMetadata {
        machine: metadata.machine,
        endianness: metadata.endianness,
        align: metadata.align,
    };

    let mut segments = Vec::new();
    for item in file.items {
        if let Item::Segment(decl) = item {
            segments.push(build_segment(decl, metadata.align, extensions)?);
        }
    }

    Ok(Program {
        metadata,
        segments,
        entry_label: entry_label.into(),
    })
}

fn build_segment(
    decl: ast::SegmentDecl,
    program_align: u64,
    extensions: &ExtensionRegistry,
) -> Result<Segment, AssemblyError> {
    let flags = parse_flags(decl.args.flags.as_deref().unwrap_or("r"))?;
    let align = decl.args.align.unwrap_or(program_align);
    let min_size = decl.args.size.unwrap_or(0);

    let mut elements = Vec::new();
    let mut labels: HashMap<String, u64> = HashMap::new();
    let mut offset = 0u64;

    for node in decl.contents {
        match node {
            Node::Byte(value) => {
                elements.push(Element::Byte(value));
                offset += 1;
            }
            Node::String(bytes) => {
                offset += bytes.len() as u64;
                elements.push(Element::Bytes(bytes));
            }
            Node::Number(literal) => {
                offset += u64::from(literal.width);
                elements.push(Element::Number {
                    value: literal.value,
                    width: literal.width,
                    signed: literal.signed,
                });
            }
            Node::Label(name) => {
                insert_label(&mut labels, &decl.name, name, offset)?;
            }
            Node::RelativeRef { target, width } => {
                elements.push(Element::RelativeRef {
                    target,
                    width,
                    offset_in_segment: offset,
                });
                offset += u64::from(width);
            }
            Node::AbsoluteRef {
                target,
                offset: disp,
                segment,
            } => {
                elements.push(Element::AbsoluteRef {
                    target,
                    segment,
                    offset: disp,
                });
                offset += 4;
            }
            Node::Extension {
                name,
                payload,
                qualified: _,
            } => {
                let payload = extensions.parse(&name, &payload)?;
                offset += payload.size();
                elements.push(Element::Extension(payload));
            }
            Node::FragmentVar(name) => {
                return Err(AssemblyError::StrayFragmentVar { name });
            }
            Node::FragmentRef(_) => {
                unreachable!("fragment reference survived preprocessing")
            }
        }
    }

    let content_size = offset;
    let mut tail_offset = content_size;
    for (name, width) in decl.auto_labels {
        insert_label(&mut labels, &decl.name, name, tail_offset)?;
        tail_offset += width;
    }
    let tail_reserved = tail_offset - content_size;

    Ok(Segment {
        name: decl.name,
        flags,
        align,
        min_size,
        elements,
        labels,
        content_size,
        tail_reserved,
        location_in_file: None,
        location_in_memory: None,
        is_header: false,
    })
}

fn insert_label(
    labels: &mut HashMap<String, u64>,
    segment: &str,
    name: String,
    offset: u64,
) -> Result<(), AssemblyError> {
    if labels.insert(name.clone(), offset).is_some() {
        return Err(AssemblyError::DuplicateLabel {
            segment: segment.to_owned(),
            label: name,
        });
    }
    Ok(())
}

fn parse_flags(text: &str) -> Result<u8, AssemblyError> {
    let mut flags = 0u8;
    for c in text.chars() {
        flags |= match c {
            'r' => 0x4,
            'w' => 0x2,
            'x' => 0x1,
            other => {
                return Err(AssemblyError::MetadataMismatch {
                    message: format!("unrecognised segment flag {other:?}"),
                })
            }
        };
    }
    Ok(flags)
}
