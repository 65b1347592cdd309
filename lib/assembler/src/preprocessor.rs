//! Include resolution, fragment gathering, and fragment expansion.
//!
//! This module turns however many source files an entry point's `include`s reach into one
//! canonical [`syntax::ast::File`] with no [`syntax::ast::Item::Include`], no
//! [`syntax::ast::Item::Fragment`], and no [`syntax::ast::Node::FragmentRef`] left in it.

use std::collections::{HashMap, HashSet};

use syntax::ast::{File, FragmentDef, FragmentRef, Item, Metadata, Node, SegmentDecl};

use crate::error::AssemblyError;

/// Resolves a logical include path to source text and a canonical identity used to detect
/// include cycles.
pub trait FileLoader {
    /// Resolves `logical_path`.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::IncludeNotFound`] if `logical_path` cannot be found.
    fn resolve(&self, logical_path: &str) -> Result<(String, String), AssemblyError>;
}

/// Parses `entry_path` and everything it transitively includes, gathers every fragment
/// definition, merges the non-`fragments`-only files' segments, and expands fragment references
/// to a fixed point.
///
/// # Errors
///
/// Returns an [`AssemblyError`] if an include cannot be found, a file fails to parse, metadata
/// conflicts across files, or fragment expansion does not converge within `max_fragment_depth`
/// passes.
pub fn preprocess(
    entry_path: &str,
    loader: &dyn FileLoader,
    max_fragment_depth: i64,
) -> Result<File, AssemblyError> {
    if max_fragment_depth < 0 {
        return Err(AssemblyError::NegativeDepth);
    }
    let max_fragment_depth = max_fragment_depth as u64;

    let mut seen = HashSet::new();
    let mut parsed = Vec::new();
    process_includes(loader, entry_path, &mut seen, false, &mut parsed)?;

    let fragments = gather_fragments(&parsed);
    let mut canonical = merge(parsed)?;

    let mut ref_num = 0u64;
    let mut unique_seen = HashSet::new();
    for _ in 0..max_fragment_depth {
        let changed = replace_fragments_once(&mut canonical, &fragments, &mut ref_num, &mut unique_seen)?;
        if !changed {
            break;
        }
    }
    if has_unexpanded_fragment_refs(&canonical) {
        return Err(AssemblyError::MaxRecursionDepth);
    }

    Ok(canonical)
}

/// Depth-first walk of the include graph, recording each parsed file alongside whether it (or
/// an ancestor include) was reached through `include fragments`. A path already in `seen` is
/// silently skipped rather than treated as an error, so mutually-including files are fine.
fn process_includes(
    loader: &dyn FileLoader,
    path: &str,
    seen: &mut HashSet<String>,
    fragments_only: bool,
    results: &mut Vec<(File, bool)>,
) -> Result<(), AssemblyError> {
    let (source, canonical) = loader.resolve(path)?;
    if !seen.insert(canonical) {
        return Ok(());
    }

    let parsed = syntax::parse(&source).map_err(|error| AssemblyError::Parse {
        path: path.to_owned(),
        message: error.to_string(),
    })?;

    let includes: Vec<(String, bool)> = parsed
        .items
        .iter()
        .filter_map(|item| match item {
            Item::Include(include) => Some((include.path.clone(), include.fragments_only)),
            _ => None,
        })
        .collect();

    results.push((parsed, fragments_only));
    for (include_path, include_fragments_only) in includes {
        process_includes(
            loader,
            &include_path,
            seen,
            fragments_only || include_fragments_only,
            results,
        )?;
    }
    Ok(())
}

/// Collects every fragment definition reachable from the entry file. When two files define a
/// fragment with the same name, the one encountered later in the depth-first include order wins.
fn gather_fragments(parsed: &[(File, bool)]) -> HashMap<String, FragmentDef> {
    let mut fragments = HashMap::new();
    for (file, _) in parsed {
        for item in &file.items {
            if let Item::Fragment(fragment) = item {
                fragments.insert(fragment.name.clone(), fragment.clone());
            }
        }
    }
    fragments
}

/// Reconciles every parsed file's `program` metadata and concatenates the segments of every
/// file that was not reached only through `include fragments`.
///
/// Metadata reconciliation considers every parsed file, `fragments`-only or not: `machine` and
/// `endianness` must agree exactly, while `align` takes the maximum across all of them.
fn merge(parsed: Vec<(File, bool)>) -> Result<File, AssemblyError> {
    let mut metadata: Option<Metadata> = None;
    for (file, _) in &parsed {
        let Some(found) = file.metadata else {
            continue;
        };
        metadata = Some(match metadata {
            None => found,
            Some(existing) => {
                if existing.machine != found.machine {
                    return Err(AssemblyError::MetadataMismatch {
                        message: format!(
                            "conflicting machine values {} and {}",
                            existing.machine, found.machine
                        ),
                    });
                }
                if existing.endianness != found.endianness {
                    return Err(AssemblyError::MetadataMismatch {
                        message: "conflicting endianness declarations".to_owned(),
                    });
                }
                Metadata {
                    align: existing.align.max(found.align),
                    ..existing
                }
            }
        });
    }
    let metadata = metadata.ok_or_else(|| AssemblyError::MetadataMismatch {
        message: "no program declaration found in the input or its includes".to_owned(),
    })?;

    let mut segments: Vec<SegmentDecl> = Vec::new();
    let mut index_of: HashMap<String, usize> = HashMap::new();
    for (file, fragments_only) in parsed {
        if fragments_only {
            continue;
        }
        for item in file.items {
            if let Item::Segment(segment) = item {
                if let Some(&index) = index_of.get(&segment.name) {
                    segments[index].contents.extend(segment.contents);
                    segments[index].auto_labels.extend(segment.auto_labels);
                } else {
                    index_of.insert(segment.name.clone(), segments.len());
                    segments.push(segment);
                }
            }
        }
    }

    Ok(File {
        metadata: Some(metadata),
        items: segments.into_iter().map(Item::Segment).collect(),
    })
}

/// Renames a label name for one fragment expansion: first applying an alias prefix (if any),
/// then, only if the result still begins with `__`, making it unique to this expansion with a
/// `ref_num` prefix. An alias already disambiguates the name, so it suppresses the `__` rename.
fn rename_label(name: &str, alias: Option<&str>, ref_num: u64) -> String {
    let renamed = match alias {
        Some(alias) => format!("{alias}.{name}"),
        None => name.to_owned(),
    };
    if renamed.starts_with("__") {
        format!("__{ref_num}{renamed}")
    } else {
        renamed
    }
}

/// Expands a fragment body, substituting `$var` placeholders, renaming labels, and threading
/// the current alias/args context into any nested (still-unexpanded) fragment references' own
/// actual arguments.
fn expand_body(
    body: &[Node],
    alias: Option<&str>,
    args: &HashMap<String, Vec<Node>>,
    ref_num: u64,
) -> Result<Vec<Node>, AssemblyError> {
    let mut buffer = Vec::with_capacity(body.len());
    for node in body {
        match node {
            Node::FragmentVar(name) => {
                let substitution = args.get(name).ok_or_else(|| AssemblyError::StrayFragmentVar {
                    name: name.clone(),
                })?;
                buffer.extend(substitution.iter().cloned());
            }
            Node::FragmentRef(inner) => {
                let mut inner = inner.clone();
                let mut new_actuals = Vec::with_capacity(inner.actuals.len());
                for actual in &inner.actuals {
                    new_actuals.push(expand_body(actual, alias, args, ref_num)?);
                }
                inner.actuals = new_actuals;
                buffer.push(Node::FragmentRef(inner));
            }
            Node::Label(name) => buffer.push(Node::Label(rename_label(name, alias, ref_num))),
            Node::RelativeRef { target, width } => buffer.push(Node::RelativeRef {
                target: rename_label(target, alias, ref_num),
                width: *width,
            }),
            Node::AbsoluteRef {
                target,
                offset,
                segment,
            } => buffer.push(Node::AbsoluteRef {
                target: rename_label(target, alias, ref_num),
                offset: *offset,
                segment: segment.clone(),
            }),
            other => buffer.push(other.clone()),
        }
    }
    Ok(buffer)
}

/// Expands one [`FragmentRef`], returning the nodes it expands to.
fn expand_reference(
    reference: &FragmentRef,
    fragments: &HashMap<String, FragmentDef>,
    ref_num: u64,
    unique_seen: &mut HashSet<String>,
) -> Result<Vec<Node>, AssemblyError> {
    if reference.unique {
        if !unique_seen.insert(reference.name.clone()) {
            return Ok(Vec::new());
        }
    }

    let fragment = fragments
        .get(&reference.name)
        .ok_or_else(|| AssemblyError::MissingFragment {
            name: reference.name.clone(),
        })?;
    if fragment.parameters.len() != reference.actuals.len() {
        return Err(AssemblyError::FragmentArity {
            name: reference.name.clone(),
            expected: fragment.parameters.len(),
            found: reference.actuals.len(),
        });
    }

    let args: HashMap<String, Vec<Node>> = fragment
        .parameters
        .iter()
        .cloned()
        .zip(reference.actuals.iter().cloned())
        .collect();

    expand_body(&fragment.body, reference.alias.as_deref(), &args, ref_num)
}

/// Runs a single expansion pass over every segment, replacing each top-level
/// [`Node::FragmentRef`] with its expansion. Returns whether any replacement happened.
fn replace_fragments_once(
    canonical: &mut File,
    fragments: &HashMap<String, FragmentDef>,
    ref_num: &mut u64,
    unique_seen: &mut HashSet<String>,
) -> Result<bool, AssemblyError> {
    let mut changed = false;
    for item in &mut canonical.items {
        let Item::Segment(segment) = item else {
            continue;
        };
        let mut new_contents = Vec::with_capacity(segment.contents.len());
        for node in segment.contents.drain(..) {
            if let Node::FragmentRef(reference) = node {
                changed = true;
                new_contents.extend(expand_reference(&reference, fragments, *ref_num, unique_seen)?);
                *ref_num += 1;
            } else {
                new_contents.push(node);
            }
        }
        segment.contents = new_contents;
    }
    Ok(changed)
}

/// Returns `true` if any segment still contains a top-level [`Node::FragmentRef`].
fn has_unexpanded_fragment_refs(canonical: &File) -> bool {
    canonical.items.iter().any(|item| match item {
        Item::Segment(segment) => segment
            .contents
            .iter()
            .any(|node| matches!(node, Node::FragmentRef(_))),
        _ => false,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;

    struct MapLoader {
        files: HashMap<&'static str, &'static str>,
        resolved: RefCell<Vec<String>>,
    }

    impl FileLoader for MapLoader {
        fn resolve(&self, logical_path: &str) -> Result<(String, String), AssemblyError> {
            self.resolved.borrow_mut().push(logical_path.to_owned());
            self.files
                .get(logical_path)
                .map(|text| ((*text).to_owned(), logical_path.to_owned()))
                .ok_or_else(|| AssemblyError::IncludeNotFound {
                    path: logical_path.to_owned(),
                })
        }
    }

    fn loader(files: &[(&'static str, &'static str)]) -> MapLoader {
        MapLoader {
            files: files.iter().copied().collect(),
            resolved: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn merges_segments_from_includes() {
        let loader = loader(&[
            ("main.eh", "program 3 < 16 include \"lib.eh\" segment code() { 00 }"),
            ("lib.eh", "segment code() { 11 }"),
        ]);
        let file = preprocess("main.eh", &loader, 8).unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        assert_eq!(segment.contents.len(), 2);
    }

    #[test]
    fn fragments_only_include_drops_segments() {
        let loader = loader(&[
            (
                "main.eh",
                "program 3 < 16 include fragments \"lib.eh\" segment code() { @f() }",
            ),
            ("lib.eh", "fragment f() { 22 } segment unused() { 33 }"),
        ]);
        let file = preprocess("main.eh", &loader, 8).unwrap();
        assert_eq!(file.items.len(), 1);
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        assert_eq!(segment.contents, vec![Node::Byte(0x22)]);
    }

    #[test]
    fn include_cycle_is_silently_suppressed() {
        let loader = loader(&[
            ("a.eh", "program 3 < 16 include \"b.eh\" segment s() { 00 }"),
            ("b.eh", "include \"a.eh\" segment s() { 11 }"),
        ]);
        let file = preprocess("a.eh", &loader, 8).unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        assert_eq!(segment.contents.len(), 2);
    }

    #[test]
    fn metadata_align_extends_to_the_maximum() {
        let loader = loader(&[
            (
                "main.eh",
                "program 3 < 16 include fragments \"lib.eh\" segment s() { 00 }",
            ),
            ("lib.eh", "program 3 < 32"),
        ]);
        let file = preprocess("main.eh", &loader, 8).unwrap();
        assert_eq!(file.metadata.unwrap().align, 32);
    }

    #[test]
    fn incompatible_machine_is_an_error() {
        let loader = loader(&[
            (
                "main.eh",
                "program 3 < 16 include fragments \"lib.eh\" segment s() { 00 }",
            ),
            ("lib.eh", "program 4 < 16"),
        ]);
        let error = preprocess("main.eh", &loader, 8).unwrap_err();
        assert!(matches!(error, AssemblyError::MetadataMismatch { .. }));
    }

    #[test]
    fn fragment_expansion_renames_local_labels_per_expansion() {
        let loader = loader(&[(
            "main.eh",
            "program 3 < 16 fragment f() { [__x] <__x> } segment s() { @f() @f() }",
        )]);
        let file = preprocess("main.eh", &loader, 8).unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        let Node::Label(first) = &segment.contents[0] else {
            panic!("expected a label");
        };
        let Node::Label(second) = &segment.contents[2] else {
            panic!("expected a label");
        };
        assert_ne!(first, second);
        assert!(first.starts_with("__0"));
        assert!(second.starts_with("__1"));
    }

    #[test]
    fn alias_suppresses_hygienic_rename() {
        let loader = loader(&[(
            "main.eh",
            "program 3 < 16 fragment f() { [__x] } segment s() { @f()(tag) }",
        )]);
        let file = preprocess("main.eh", &loader, 8).unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        let Node::Label(label) = &segment.contents[0] else {
            panic!("expected a label");
        };
        assert_eq!(label, "tag.__x");
    }

    #[test]
    fn unique_fragment_expands_once() {
        let loader = loader(&[(
            "main.eh",
            "program 3 < 16 fragment f() { 00 } segment s() { @!f() @!f() }",
        )]);
        let file = preprocess("main.eh", &loader, 8).unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        assert_eq!(segment.contents, vec![Node::Byte(0x00)]);
    }

    #[test]
    fn missing_fragment_is_an_error() {
        let loader = loader(&[("main.eh", "program 3 < 16 segment s() { @missing() }")]);
        let error = preprocess("main.eh", &loader, 8).unwrap_err();
        assert!(matches!(error, AssemblyError::MissingFragment { .. }));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let loader = loader(&[(
            "main.eh",
            "program 3 < 16 fragment f(a) { $a } segment s() { @f() }",
        )]);
        let error = preprocess("main.eh", &loader, 8).unwrap_err();
        assert!(matches!(error, AssemblyError::FragmentArity { .. }));
    }

    #[test]
    fn self_recursive_fragment_hits_max_depth() {
        let loader = loader(&[(
            "main.eh",
            "program 3 < 16 fragment f() { @f() } segment s() { @f() }",
        )]);
        let error = preprocess("main.eh", &loader, 4).unwrap_err();
        assert!(matches!(error, AssemblyError::MaxRecursionDepth));
    }

    #[test]
    fn negative_depth_is_rejected() {
        let loader = loader(&[("main.eh", "program 3 < 16 segment s() { 00 }")]);
        let error = preprocess("main.eh", &loader, -1).unwrap_err();
        assert!(matches!(error, AssemblyError::NegativeDepth));
    }
}
