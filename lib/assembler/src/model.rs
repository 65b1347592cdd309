//! The assembled program model: the tree the layout engine and renderer operate on, after
//! includes have been resolved and every fragment reference has been expanded away.

use std::collections::HashMap;

use syntax::ast::Endianness;

use crate::error::AssemblyError;
use crate::extensions::ExtensionPayload;

/// Program-wide settings resolved from every parsed file's `program` declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedMetadata {
    /// The value written to `e_machine`.
    pub machine: u16,
    /// The byte order every multi-byte field is packed in.
    pub endianness: Endianness,
    /// The default segment alignment, used when a segment does not override it.
    pub align: u64,
}

/// A fully expanded program, ready for layout.
#[derive(Debug)]
pub struct Program {
    /// The resolved program metadata.
    pub metadata: ResolvedMetadata,
    /// Segments in declaration order. The first file's segment order determines the file's
    /// layout order; segments merged in from other files are appended once, at first mention.
    pub segments: Vec<Segment>,
    /// The label naming the first instruction to execute.
    pub entry_label: String,
}

impl Program {
    /// Returns the segment with the given name, if one exists.
    #[must_use]
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.name == name)
    }

    /// Returns the absolute memory address of `label` in `segment`, if both exist and layout has
    /// already run.
    #[must_use]
    pub fn label_location(&self, segment: &str, label: &str) -> Option<u64> {
        let segment = self.segment(segment)?;
        let offset = *segment.labels.get(label)?;
        Some(segment.location_in_memory? + offset)
    }

    /// Returns the name of the first segment whose labels include `label`, other than
    /// `excluding`. Used to tell an undefined label apart from a relative reference that
    /// crossed a segment boundary.
    #[must_use]
    pub fn segment_defining(&self, label: &str, excluding: &str) -> Option<&str> {
        self.segments
            .iter()
            .find(|segment| segment.name != excluding && segment.labels.contains_key(label))
            .map(|segment| segment.name.as_str())
    }

    /// Resolves an absolute reference's target address.
    ///
    /// When `segment` is given, `label` is looked up in that segment only. Otherwise every
    /// segment is searched in insertion order and the first match wins, per the "search all
    /// segments" rule an unqualified `<<label>>` reference follows.
    #[must_use]
    pub fn label_address(&self, label: &str, segment: Option<&str>) -> Option<u64> {
        match segment {
            Some(segment) => self.label_location(segment, label),
            None => self.segments.iter().find_map(|segment| {
                let offset = *segment.labels.get(label)?;
                Some(segment.location_in_memory? + offset)
            }),
        }
    }

    /// Returns the entry point's absolute memory address.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::MissingEntryLabel`] if no segment defines the entry label.
    pub fn entry_point(&self) -> Result<u64, AssemblyError> {
        for segment in &self.segments {
            if let Some(&offset) = segment.labels.get(&self.entry_label) {
                let base = segment
                    .location_in_memory
                    .expect("entry_point called before layout");
                return Ok(base + offset);
            }
        }
        Err(AssemblyError::MissingEntryLabel {
            label: self.entry_label.clone(),
        })
    }
}

/// A contiguous, independently positioned region of the output file.
#[derive(Debug)]
pub struct Segment {
    /// The segment's name, unique within a [`Program`].
    pub name: String,
    /// The `PT_LOAD` segment's `p_flags`, already reduced to the `r`/`w`/`x` bitmask.
    pub flags: u8,
    /// The segment's alignment, already resolved against the program default.
    pub align: u64,
    /// The minimum in-memory size requested by the source (`size: N`), zero if unspecified.
    pub min_size: u64,
    /// The segment's content, in source order.
    pub elements: Vec<Element>,
    /// Label name to byte offset within this segment's content.
    pub labels: HashMap<String, u64>,
    /// This segment's size in the file, in bytes: the sum of its rendered elements, not
    /// counting any `[[...]]` auto-label reservation. Populated during transform, before
    /// layout.
    pub content_size: u64,
    /// Bytes reserved past `content_size` by `[[...]]` auto-labels. These never appear in the
    /// rendered file; they widen `p_memsz` past `p_filesz` so the loader zero-fills them, the
    /// same mechanism a BSS section relies on.
    pub tail_reserved: u64,
    /// The segment's offset in the output file. Populated by the layout engine.
    pub location_in_file: Option<u64>,
    /// The segment's virtual address. Populated by the layout engine.
    pub location_in_memory: Option<u64>,
    /// Set on the synthetic `__header__` segment that `--header-segment` inserts; `elements` is
    /// empty and [`crate::render`] emits the ELF header and program header table for it
    /// instead of walking `elements`.
    pub is_header: bool,
}

impl Segment {
    /// The segment's size as written to the file (`p_filesz`).
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.content_size
    }

    /// The segment's size in memory (`p_memsz`): at least `content_size + tail_reserved`, and
    /// at least `min_size`.
    #[must_use]
    pub fn memory_size(&self) -> u64 {
        (self.content_size + self.tail_reserved).max(self.min_size)
    }
}

/// One piece of a segment's content.
#[derive(Debug)]
pub enum Element {
    /// A single literal byte.
    Byte(u8),
    /// A sequence of literal bytes, from a string literal.
    Bytes(Vec<u8>),
    /// A numeric literal, packed to `width` bytes in the program's endianness.
    Number {
        /// The literal's value.
        value: i128,
        /// The packed width, in bytes.
        width: u8,
        /// `true` if the literal used a signed prefix (`+`/`-`); `false` for unsigned (`=`).
        signed: bool,
    },
    /// A relative reference: the signed byte distance from just after this reference to
    /// `target`, both within the same segment.
    RelativeRef {
        /// The referenced label.
        target: String,
        /// The packed width, in bytes.
        width: u8,
        /// This reference's own byte offset within the segment, set during transform.
        offset_in_segment: u64,
    },
    /// An absolute reference: `target`'s resolved virtual address, plus `offset`, packed as a
    /// 4-byte value in the program's endianness.
    AbsoluteRef {
        /// The referenced label.
        target: String,
        /// The segment `target` is expected to live in, if the reference was qualified
        /// (`<<seg:name>>`). `None` means every segment is searched, in insertion order.
        segment: Option<String>,
        /// A constant added to the resolved address.
        offset: i64,
    },
    /// An opaque extension payload.
    Extension(Box<dyn ExtensionPayload>),
}

impl Element {
    /// This element's size in the rendered output, in bytes.
    ///
    /// # Panics
    ///
    /// Never, for any `Element` a transform built from a valid program.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Byte(_) => 1,
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::Number { width, .. } | Self::RelativeRef { width, .. } => u64::from(*width),
            Self::AbsoluteRef { .. } => 4,
            Self::Extension(payload) => payload.size(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use syntax::ast::Endianness;

    fn segment(name: &str, labels: &[(&str, u64)], location_in_memory: Option<u64>) -> Segment {
        Segment {
            name: name.to_owned(),
            flags: 0x4,
            align: 16,
            min_size: 0,
            elements: Vec::new(),
            labels: labels.iter().map(|(n, o)| ((*n).to_owned(), *o)).collect::<HashMap<_, _>>(),
            content_size: 0,
            tail_reserved: 0,
            location_in_file: None,
            location_in_memory,
            is_header: false,
        }
    }

    fn program(segments: Vec<Segment>) -> Program {
        Program {
            metadata: ResolvedMetadata {
                machine: 3,
                endianness: Endianness::Little,
                align: 16,
            },
            segments,
            entry_label: "main".to_owned(),
        }
    }

    #[test]
    fn unqualified_label_address_searches_segments_in_order() {
        let program = program(vec![
            segment("a", &[], Some(0x1000)),
            segment("b", &[("target", 4)], Some(0x2000)),
        ]);
        assert_eq!(program.label_address("target", None), Some(0x2004));
    }

    #[test]
    fn qualified_label_address_only_checks_the_named_segment() {
        let program = program(vec![
            segment("a", &[], Some(0x1000)),
            segment("b", &[("target", 4)], Some(0x2000)),
        ]);
        assert_eq!(program.label_address("target", Some("a")), None);
        assert_eq!(program.label_address("target", Some("b")), Some(0x2004));
    }
}
