//! The abstract syntax tree produced by [`crate::parser`].
//!
//! A [`File`] corresponds to one parsed source file. The preprocessor is responsible for
//! resolving `include`s across several [`File`]s and expanding [`FragmentRef`]s into a single
//! canonical tree; nothing in this module performs that work.

/// One parsed source file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct File {
    /// The `program` declaration, if this file has one.
    ///
    /// Files that exist only to be `include fragments`d need not declare metadata.
    pub metadata: Option<Metadata>,
    /// `include`, `fragment`, and `segment` declarations, in source order.
    pub items: Vec<Item>,
}

/// A top-level declaration inside a [`File`], other than the `program` line.
#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    /// An `include` directive.
    Include(Include),
    /// A `fragment` definition.
    Fragment(FragmentDef),
    /// A `segment` declaration.
    Segment(SegmentDecl),
}

/// The `program` declaration: `program MACHINE ENDIAN ALIGN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// The value written to `e_machine`.
    pub machine: u16,
    /// The byte order used to pack every multi-byte field in the assembled program.
    pub endianness: Endianness,
    /// The default segment alignment.
    pub align: u64,
}

/// The byte order of an assembled program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    /// `<`, little-endian.
    Little,
    /// `>`, big-endian.
    Big,
}

/// An `include "path"` or `include fragments "path"` directive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Include {
    /// The logical path handed to the file loader.
    pub path: String,
    /// `true` if this is `include fragments`, meaning the included file's segments are
    /// discarded and only its fragment definitions survive.
    pub fragments_only: bool,
}

/// A `fragment name(p1 p2 ...) { body }` definition.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentDef {
    /// The fragment's name.
    pub name: String,
    /// The ordered list of formal parameter names.
    pub parameters: Vec<String>,
    /// The fragment's body, which may reference `parameters` via [`Node::FragmentVar`].
    pub body: Vec<Node>,
}

/// A `segment name(args) { content }` declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentDecl {
    /// The segment's name.
    pub name: String,
    /// The segment's configuration, parsed from `(key: value ...)`.
    pub args: SegmentArgs,
    /// The segment's content, in source order, with any `[[...]]` auto-label blocks removed.
    pub contents: Vec<Node>,
    /// Auto-labels gathered from every `[[...]]` block in the segment, concatenated in the
    /// order the blocks appeared.
    pub auto_labels: Vec<(String, u64)>,
}

/// Recognised options in a segment's `(key: value ...)` argument list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentArgs {
    /// `flags: <subset of rwx>`, default `r`.
    pub flags: Option<String>,
    /// `align: <power of two>`, overriding the program default.
    pub align: Option<u64>,
    /// `size: <minimum in-memory size>`.
    pub size: Option<u64>,
}

/// A node appearing inside a segment's content, a fragment's body, or a fragment-reference
/// actual argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// A literal byte, written as a two-hex-digit pair (`ff`).
    Byte(u8),
    /// A numeric literal (`=10d4`, `+ah2`, `-1001b`).
    Number(NumberLit),
    /// An ASCII string literal.
    String(Vec<u8>),
    /// A label definition (`[name]`).
    Label(String),
    /// A relative reference (`<name>`, `<name:width>`).
    RelativeRef {
        /// The referenced label's name.
        target: String,
        /// The width, in bytes, of the packed signed offset.
        width: u8,
    },
    /// An absolute reference (`<<name>>`, `<<name + offset>>`, `<<seg:name>>`).
    AbsoluteRef {
        /// The referenced label's name.
        target: String,
        /// A constant offset added to the label's resolved address.
        offset: i64,
        /// An explicit owning segment, when the reference used the `seg:name` form.
        segment: Option<String>,
    },
    /// A reference to a fragment (`@name(...)`, `@!name(...)`, `@name(...)(alias)`), not yet
    /// expanded.
    FragmentRef(FragmentRef),
    /// A placeholder (`$name`) inside a fragment body, substituted with an actual argument
    /// during expansion.
    FragmentVar(String),
    /// An opaque extension block (`:name { text }`, `::name { text }`).
    Extension {
        /// The extension's registered name.
        name: String,
        /// The raw, unparsed text between the braces.
        payload: String,
        /// `true` if the block used the `::` (qualified) form.
        qualified: bool,
    },
}

/// A parsed numeric literal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NumberLit {
    /// The literal's value, already applying the sign.
    pub value: i128,
    /// The packed width, in bytes.
    pub width: u8,
    /// `true` if the literal used a signed prefix (`+`/`-`); `false` for unsigned (`=`).
    pub signed: bool,
}

/// A not-yet-expanded reference to a fragment.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentRef {
    /// The referenced fragment's name.
    pub name: String,
    /// The actual arguments, one list of nodes per formal parameter.
    pub actuals: Vec<Vec<Node>>,
    /// An optional alias prefixed onto every label this expansion defines or references.
    pub alias: Option<String>,
    /// `true` if this is a `@!` reference, expanded at most once per program.
    pub unique: bool,
}
