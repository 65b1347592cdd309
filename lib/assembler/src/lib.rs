//! Preprocessing, transformation, layout, and rendering for the ELFHex assembler.
//!
//! The stages compose in one direction: [`preprocessor::preprocess`] resolves includes and
//! fragments into a single [`syntax::ast::File`], [`transform::transform`] turns that into a
//! [`model::Program`], [`layout::layout`] positions its segments, and [`render::render`] emits
//! the final ELF32 bytes.

pub mod error;
pub mod extensions;
pub mod layout;
pub mod model;
pub mod preprocessor;
pub mod render;
pub mod transform;

pub use error::AssemblyError;
pub use extensions::ExtensionRegistry;
pub use model::Program;
pub use preprocessor::FileLoader;

/// Options controlling one run of [`assemble`].
#[derive(Clone, Debug)]
pub struct AssembleOptions {
    /// The label naming the first instruction to execute.
    pub entry_label: String,
    /// The maximum number of fixed-point passes fragment expansion may take.
    pub max_fragment_depth: i64,
    /// The virtual address the ELF header itself is mapped at.
    pub memory_start: u64,
    /// Skip the ELF header and program header table, emitting raw segment bytes only.
    pub no_header: bool,
    /// Place the ELF header and program header table in their own `PT_LOAD` segment instead of
    /// prepending them to the first user segment. Ignored when `no_header` is set.
    pub header_segment: bool,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            entry_label: "_start".to_owned(),
            max_fragment_depth: 16,
            memory_start: 0x0804_8000,
            no_header: false,
            header_segment: false,
        }
    }
}

/// Runs every stage — preprocess, transform, layout, render — and returns the bytes of an ELF32
/// executable.
///
/// When `options.no_header` is set, segments are laid out directly at `memory_start` with no file
/// header or program header table reserved in front of them, and the result is just their
/// concatenated contents. Otherwise, `options.header_segment` chooses between prepending the
/// header to the first user segment (default) and giving it a dedicated `PT_LOAD` segment named
/// `__header__`.
///
/// # Errors
///
/// Returns whatever [`preprocessor::preprocess`], [`transform::transform`], or
/// [`render::render`] return.
pub fn assemble(
    entry_path: &str,
    loader: &dyn FileLoader,
    extensions: &ExtensionRegistry,
    options: &AssembleOptions,
) -> Result<Vec<u8>, AssemblyError> {
    let preprocessed = preprocessor::preprocess(entry_path, loader, options.max_fragment_depth)?;
    let mut program = transform::transform(preprocessed, options.entry_label.clone(), extensions)?;

    if options.no_header {
        layout::layout(&mut program, 0, options.memory_start, program.metadata.align);
        render::render_body(&program)
    } else if options.header_segment {
        render::insert_header_segment(&mut program);
        layout::layout(&mut program, 0, options.memory_start, program.metadata.align);
        render::render_body(&program)
    } else {
        let header_size = render::header_size(&program);
        layout::layout(&mut program, header_size, options.memory_start, program.metadata.align);
        render::render(&program)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    struct MapLoader(HashMap<&'static str, &'static str>);

    impl FileLoader for MapLoader {
        fn resolve(&self, logical_path: &str) -> Result<(String, String), AssemblyError> {
            self.0
                .get(logical_path)
                .map(|text| ((*text).to_owned(), logical_path.to_owned()))
                .ok_or_else(|| AssemblyError::IncludeNotFound {
                    path: logical_path.to_owned(),
                })
        }
    }

    #[test]
    fn assembles_a_minimal_program_end_to_end() {
        let loader = MapLoader(HashMap::from([(
            "main.eh",
            "program 3 < 16 segment code(flags: rx) { [main] 90 }",
        )]));
        let bytes = assemble(
            "main.eh",
            &loader,
            &ExtensionRegistry::with_builtins(),
            &AssembleOptions::default(),
        )
        .unwrap();

        assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);
        assert_eq!(*bytes.last().unwrap(), 0x90);
    }

    #[test]
    fn missing_entry_label_is_reported() {
        let loader = MapLoader(HashMap::from([(
            "main.eh",
            "program 3 < 16 segment code() { 90 }",
        )]));
        let error = assemble(
            "main.eh",
            &loader,
            &ExtensionRegistry::with_builtins(),
            &AssembleOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(error, AssemblyError::MissingEntryLabel { .. }));
    }

    #[test]
    fn header_segment_gets_its_own_pt_load_entry() {
        let loader = MapLoader(HashMap::from([(
            "main.eh",
            "program 3 < 16 segment code(flags: rx) { [main] 90 }",
        )]));
        let options = AssembleOptions {
            header_segment: true,
            ..AssembleOptions::default()
        };
        let bytes = assemble("main.eh", &loader, &ExtensionRegistry::with_builtins(), &options).unwrap();

        assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);
        // e_phnum: one entry for __header__, one for code.
        assert_eq!(&bytes[44..46], &2u16.to_le_bytes());
        assert_eq!(*bytes.last().unwrap(), 0x90);
    }

    #[test]
    fn unqualified_absolute_reference_searches_every_segment() {
        let loader = MapLoader(HashMap::from([(
            "main.eh",
            "program 3 < 16 \
             segment a(flags: rx) { [_start] <<target>> } \
             segment b() { [target] ff }",
        )]));
        let bytes = assemble(
            "main.eh",
            &loader,
            &ExtensionRegistry::with_builtins(),
            &AssembleOptions::default(),
        )
        .unwrap();
        assert!(bytes.ends_with(&[0xff]));
    }

    /// End-to-end scenarios, `--no-header`, little-endian, `machine=3`, `align=16`.
    mod scenarios {
        use super::*;

        fn assemble_no_header(source: &'static str, memory_start: u64) -> Vec<u8> {
            let loader = MapLoader(HashMap::from([("main.eh", source)]));
            let options = AssembleOptions {
                no_header: true,
                memory_start,
                ..AssembleOptions::default()
            };
            assemble("main.eh", &loader, &ExtensionRegistry::with_builtins(), &options).unwrap()
        }

        #[test]
        fn scenario_1_raw_bytes() {
            let bytes = assemble_no_header("program 3 < 16 segment a() { [_start] ff ee }", 0x1000);
            assert_eq!(bytes, vec![0xff, 0xee]);
        }

        #[test]
        fn scenario_2_one_byte_relative_reference() {
            let bytes =
                assemble_no_header("program 3 < 16 segment a() { [_start] [t] 00 <t> }", 0x1000);
            assert_eq!(bytes, vec![0x00, 0xfe]);
        }

        #[test]
        fn scenario_3_four_byte_relative_reference() {
            let bytes =
                assemble_no_header("program 3 < 16 segment a() { [_start] [t] 00 <t:4> }", 0x1000);
            assert_eq!(bytes, vec![0x00, 0xfb, 0xff, 0xff, 0xff]);
        }

        #[test]
        fn scenario_4_absolute_reference() {
            let bytes = assemble_no_header(
                "program 3 < 16 segment a() { [_start] 11 [t] 00 <<t>> }",
                0x1000,
            );
            assert_eq!(bytes, vec![0x11, 0x00, 0x01, 0x10, 0x00, 0x00]);
        }

        #[test]
        fn scenario_5_number_literals() {
            let bytes = assemble_no_header(
                "program 3 < 16 segment a() { [_start] 11 =11111111b =16d2 =aah4 00 }",
                0x1000,
            );
            assert_eq!(
                bytes,
                vec![0x11, 0xff, 0x10, 0x00, 0xaa, 0x00, 0x00, 0x00, 0x00]
            );
        }

        #[test]
        fn scenario_6_auto_labels() {
            let bytes = assemble_no_header(
                "program 3 < 16 segment a() { [_start] ff <l> <l2> [[l: 4 l2: 8]] }",
                0x1000,
            );
            assert_eq!(bytes, vec![0xff, 0x01, 0x04]);
        }

        #[test]
        fn scenario_7_full_elf_header_entry_point() {
            let loader = MapLoader(HashMap::from([(
                "main.eh",
                "program 3 < 16 segment a(flags: rx) { [_start] 90 }",
            )]));
            let options = AssembleOptions {
                memory_start: 0x1000,
                ..AssembleOptions::default()
            };
            let bytes =
                assemble("main.eh", &loader, &ExtensionRegistry::with_builtins(), &options).unwrap();

            assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);

            let header_size = 52 + 32 * 1u64;
            let mut program = transform::transform(
                preprocessor::preprocess("main.eh", &loader, 16).unwrap(),
                "_start",
                &ExtensionRegistry::with_builtins(),
            )
            .unwrap();
            layout::layout(&mut program, header_size, options.memory_start, program.metadata.align);
            let expected_entry = program.entry_point().unwrap();

            let e_entry = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
            assert_eq!(u64::from(e_entry), expected_entry);
            // Invariant 2: a segment's file and memory offsets stay congruent mod its alignment.
            assert_eq!(header_size % program.metadata.align, expected_entry % program.metadata.align);
        }
    }
}
