//! The extension seam: a way for an `:ext { ... }` block to render bytes the core element set
//! cannot express directly.

pub mod modrm;

use std::collections::HashMap;
use std::fmt;

use crate::error::AssemblyError;
use crate::model::Program;

/// Everything an [`ExtensionPayload`] needs to resolve labels and pack values.
pub struct RenderContext<'a> {
    /// The fully laid-out program, for resolving label addresses.
    pub program: &'a Program,
    /// The name of the segment this payload was rendered from, used when a reference omits an
    /// explicit segment.
    pub segment: &'a str,
}

/// An opaque, extension-supplied element payload.
///
/// An extension parses its own raw text (captured verbatim by the surface parser) into a value
/// implementing this trait, and from then on the core crate treats it like any other element:
/// it only ever calls `size` and `render`.
pub trait ExtensionPayload: fmt::Debug {
    /// This payload's rendered size, in bytes. Must match the length `render` returns.
    fn size(&self) -> u64;

    /// Renders this payload to bytes, resolving any label references against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Extension`] if the payload cannot be rendered, for instance
    /// because it references a label that does not exist.
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Vec<u8>, AssemblyError>;
}

/// A constructor for a named extension, turning the raw text of an `:ext { ... }` block into a
/// boxed [`ExtensionPayload`].
pub type ExtensionParser = fn(&str) -> Result<Box<dyn ExtensionPayload>, AssemblyError>;

/// Maps extension names to their parsers.
#[derive(Default)]
pub struct ExtensionRegistry {
    /// The registered parsers, keyed by extension name.
    parsers: HashMap<String, ExtensionParser>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry containing every extension built into this crate.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("modrm", modrm::parse);
        registry
    }

    /// Registers `parser` under `name`, replacing any existing registration.
    pub fn register(&mut self, name: impl Into<String>, parser: ExtensionParser) {
        self.parsers.insert(name.into(), parser);
    }

    /// Parses `raw_text` using the parser registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::UnknownExtension`] if no parser is registered under `name`, or
    /// whatever error the registered parser itself returns.
    pub fn parse(&self, name: &str, raw_text: &str) -> Result<Box<dyn ExtensionPayload>, AssemblyError> {
        let parser = self
            .parsers
            .get(name)
            .ok_or_else(|| AssemblyError::UnknownExtension {
                name: name.to_owned(),
            })?;
        parser(raw_text)
    }
}
