//! A minimal x86 ModR/M extension.
//!
//! This is deliberately not a full addressing-mode encoder — no scaled index (SIB), no 16-bit
//! forms. It is enough to exercise the extension seam end to end: register-direct and
//! register-indirect operands, `esp`/`ebp` special cases, and displacement either as a literal
//! or as a reference to a label's resolved address.

use core::fmt;

use crate::error::AssemblyError;
use crate::extensions::{ExtensionPayload, RenderContext};

/// Parses the text of a `:modrm { ... }` block.
///
/// Accepted forms:
/// - `mod=M reg=R rm=N` — the three ModR/M fields written out directly, each `0..=7` (`mod` is
///   `0..=3`).
/// - `reg, rm` — Intel-style operands, where `reg` is a register name or a field number, and
///   `rm` is a register name (direct) or `[...]` (indirect, with an optional `+disp`, where
///   `disp` is a decimal literal or a `<label>`/`<seg:label>` reference).
///
/// # Errors
///
/// Returns [`AssemblyError::Extension`] if `text` matches neither form.
pub fn parse(text: &str) -> Result<Box<dyn ExtensionPayload>, AssemblyError> {
    let text = text.trim();
    if let Some(fields) = parse_explicit(text)? {
        return Ok(Box::new(fields));
    }
    parse_operands(text).map(|modrm| Box::new(modrm) as Box<dyn ExtensionPayload>)
}

fn parse_explicit(text: &str) -> Result<Option<ModRm>, AssemblyError> {
    let mut mod_bits = None;
    let mut reg = None;
    let mut rm = None;
    let mut any = false;
    for field in text.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            return Ok(None);
        };
        any = true;
        let value: u8 = value
            .parse()
            .map_err(|_| extension_error(format!("invalid field value {value:?}")))?;
        match key {
            "mod" => mod_bits = Some(value),
            "reg" => reg = Some(value),
            "rm" => rm = Some(value),
            other => return Err(extension_error(format!("unrecognised field {other:?}"))),
        }
    }
    if !any {
        return Ok(None);
    }
    let (mod_bits, reg, rm) = (
        mod_bits.ok_or_else(|| extension_error("missing 'mod' field"))?,
        reg.ok_or_else(|| extension_error("missing 'reg' field"))?,
        rm.ok_or_else(|| extension_error("missing 'rm' field"))?,
    );
    if mod_bits > 0b11 || reg > 0b111 || rm > 0b111 {
        return Err(extension_error("field value out of range"));
    }
    Ok(Some(ModRm::Explicit {
        byte: (mod_bits << 6) | (reg << 3) | rm,
    }))
}

fn parse_operands(text: &str) -> Result<ModRm, AssemblyError> {
    let (reg_text, rm_text) = text
        .split_once(',')
        .ok_or_else(|| extension_error(format!("couldn't parse operands {text:?}")))?;
    let reg = register(reg_text.trim())?;
    let rm_text = rm_text.trim();

    if let Some(inner) = rm_text.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let (base, disp) = parse_base_and_disp(inner.trim())?;
        Ok(ModRm::Indirect { reg, base, disp })
    } else {
        let rm = register(rm_text)?;
        Ok(ModRm::Direct { reg, rm })
    }
}

/// Splits a `[...]` operand's interior into an optional base register and displacement.
///
/// `base+disp` and `base-disp` both name a base register. A bare interior is first tried as a
/// register (`[ebx]`), and only treated as a disp32-only operand (`[1000]`, `[<label>]`) if that
/// fails.
fn parse_base_and_disp(inner: &str) -> Result<(Option<u8>, Disp), AssemblyError> {
    if let Some(idx) = inner[1..].find(['+', '-']).map(|idx| idx + 1) {
        let (base_text, disp_text) = inner.split_at(idx);
        let base = register(base_text.trim())?;
        let disp = parse_disp(disp_text.trim())?;
        return Ok((Some(base), disp));
    }
    if inner.is_empty() {
        return Ok((None, Disp::None));
    }
    if let Ok(base) = register(inner) {
        return Ok((Some(base), Disp::None));
    }
    Ok((None, parse_disp(inner)?))
}

fn parse_disp(text: &str) -> Result<Disp, AssemblyError> {
    let text = text.trim();
    let (sign, text) = match text.strip_prefix('-') {
        Some(rest) => (-1i32, rest.trim()),
        None => (1, text.strip_prefix('+').unwrap_or(text).trim()),
    };
    if let Some(label) = text.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
        return match label.split_once(':') {
            Some((segment, label)) => Ok(Disp::Label {
                segment: Some(segment.to_owned()),
                label: label.to_owned(),
            }),
            None => Ok(Disp::Label {
                segment: None,
                label: label.to_owned(),
            }),
        };
    }
    let magnitude: i32 = text
        .parse()
        .map_err(|_| extension_error(format!("invalid displacement {text:?}")))?;
    Ok(Disp::Imm(sign * magnitude))
}

fn register(name: &str) -> Result<u8, AssemblyError> {
    if let Ok(value) = name.parse::<u8>() {
        if value <= 0b111 {
            return Ok(value);
        }
    }
    match name.to_ascii_lowercase().as_str() {
        "eax" => Ok(0),
        "ecx" => Ok(1),
        "edx" => Ok(2),
        "ebx" => Ok(3),
        "esp" => Ok(4),
        "ebp" => Ok(5),
        "esi" => Ok(6),
        "edi" => Ok(7),
        other => Err(extension_error(format!("unrecognised register {other:?}"))),
    }
}

fn extension_error(message: impl Into<String>) -> AssemblyError {
    AssemblyError::Extension {
        name: "modrm".to_owned(),
        message: message.into(),
    }
}

/// A displacement attached to a register-indirect operand.
#[derive(Debug)]
enum Disp {
    /// No displacement.
    None,
    /// A literal displacement.
    Imm(i32),
    /// A displacement taken from a label's resolved address.
    Label {
        /// An explicit owning segment, if the reference used `seg:label`.
        segment: Option<String>,
        /// The label's name.
        label: String,
    },
}

/// A parsed `:modrm { ... }` payload.
#[derive(Debug)]
enum ModRm {
    /// The three fields were given explicitly; the byte is already final.
    Explicit {
        /// The packed ModR/M byte.
        byte: u8,
    },
    /// A register-direct operand (`mod == 0b11`).
    Direct {
        /// The `reg` field.
        reg: u8,
        /// The `rm` field.
        rm: u8,
    },
    /// A register-indirect operand, with an optional base register and displacement.
    Indirect {
        /// The `reg` field.
        reg: u8,
        /// The base register, absent for a disp32-only operand.
        base: Option<u8>,
        /// The operand's displacement.
        disp: Disp,
    },
}

impl ModRm {
    fn resolve_disp(&self, ctx: &RenderContext<'_>) -> Result<Option<i32>, AssemblyError> {
        let Self::Indirect { disp, .. } = self else {
            return Ok(None);
        };
        match disp {
            Disp::None => Ok(None),
            Disp::Imm(value) => Ok(Some(*value)),
            Disp::Label { segment, label } => {
                let segment = segment.as_deref().unwrap_or(ctx.segment);
                let address = ctx
                    .program
                    .label_location(segment, label)
                    .ok_or_else(|| AssemblyError::UndefinedLabel {
                        segment: Some(segment.to_owned()),
                        label: label.clone(),
                    })?;
                Ok(Some(address as i32))
            }
        }
    }

    fn bytes(&self, ctx: &RenderContext<'_>) -> Result<Vec<u8>, AssemblyError> {
        match self {
            Self::Explicit { byte } => Ok(vec![*byte]),
            Self::Direct { reg, rm } => Ok(vec![0b11 << 6 | reg << 3 | rm]),
            Self::Indirect { reg, base, disp } => {
                let disp_value = self.resolve_disp(ctx)?;
                let forced_disp32 = matches!(disp, Disp::Label { .. });
                let reg_bits = reg << 3;

                match base {
                    None => {
                        let mut out = vec![reg_bits | 0b101];
                        out.extend((disp_value.unwrap_or(0)).to_le_bytes());
                        Ok(out)
                    }
                    Some(4) => {
                        // esp (and r12 in 64-bit mode) always needs a no-index SIB byte.
                        let (mode, disp_bytes) = encode_disp(disp_value, forced_disp32);
                        let mut out = vec![mode | reg_bits | 0b100, 0x24];
                        out.extend(disp_bytes);
                        Ok(out)
                    }
                    Some(5) if disp_value.is_none() && !forced_disp32 => {
                        // ebp with no displacement must be encoded as mod=01, disp8=0.
                        Ok(vec![0b01 << 6 | reg_bits | 0b101, 0])
                    }
                    Some(base) => {
                        let (mode, disp_bytes) = encode_disp(disp_value, forced_disp32);
                        let mut out = vec![mode | reg_bits | base];
                        out.extend(disp_bytes);
                        Ok(out)
                    }
                }
            }
        }
    }
}

fn encode_disp(value: Option<i32>, forced_disp32: bool) -> (u8, Vec<u8>) {
    match value {
        None => (0b00 << 6, Vec::new()),
        Some(value) if !forced_disp32 && i8::try_from(value).is_ok() => {
            (0b01 << 6, vec![value as i8 as u8])
        }
        Some(value) => (0b10 << 6, value.to_le_bytes().to_vec()),
    }
}

impl ExtensionPayload for ModRm {
    fn size(&self) -> u64 {
        match self {
            Self::Explicit { .. } | Self::Direct { .. } => 1,
            Self::Indirect { base, disp, .. } => {
                let disp_len: u64 = match (base, disp) {
                    (_, Disp::Label { .. }) => 4,
                    (None, _) => 4,
                    (Some(4), Disp::None) => 0,
                    (Some(4), Disp::Imm(value)) if i8::try_from(*value).is_ok() => 1,
                    (Some(4), Disp::Imm(_)) => 4,
                    (Some(5), Disp::None) => 1,
                    (Some(_), Disp::None) => 0,
                    (Some(_), Disp::Imm(value)) if i8::try_from(*value).is_ok() => 1,
                    (Some(_), Disp::Imm(_)) => 4,
                };
                let sib: u64 = if matches!(base, Some(4)) { 1 } else { 0 };
                1 + sib + disp_len
            }
        }
    }

    fn render(&self, ctx: &RenderContext<'_>) -> Result<Vec<u8>, AssemblyError> {
        self.bytes(ctx)
    }
}

impl fmt::Display for ModRm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn render_no_labels(modrm: &ModRm) -> Vec<u8> {
        // Constructing a Program here would require a full layout run; every case exercised in
        // these tests never reaches resolve_disp's label branch.
        let program = crate::model::Program {
            metadata: crate::model::ResolvedMetadata {
                machine: 0,
                endianness: syntax::ast::Endianness::Little,
                align: 1,
            },
            segments: Vec::new(),
            entry_label: String::new(),
        };
        modrm.bytes(&RenderContext {
            program: &program,
            segment: "",
        })
        .expect("no label resolution required")
    }

    #[test]
    fn explicit_fields() {
        let Ok(payload) = parse_explicit("mod=3 reg=0 rm=1") else {
            panic!("expected explicit fields");
        };
        let ModRm::Explicit { byte } = payload.unwrap() else {
            panic!("expected Explicit");
        };
        assert_eq!(byte, 0b11_000_001);
    }

    #[test]
    fn register_direct() {
        let modrm = parse_operands("ebx, esi").unwrap();
        assert_eq!(render_no_labels(&modrm), vec![0b11_011_110]);
    }

    #[test]
    fn indirect_with_esp_needs_sib() {
        let modrm = parse_operands("eax, [esp]").unwrap();
        assert_eq!(render_no_labels(&modrm), vec![0b00_000_100, 0x24]);
    }

    #[test]
    fn indirect_ebp_with_no_disp_forces_disp8_zero() {
        let modrm = parse_operands("eax, [ebp]").unwrap();
        assert_eq!(render_no_labels(&modrm), vec![0b01_000_101, 0]);
    }

    #[test]
    fn indirect_with_small_displacement() {
        let modrm = parse_operands("edx, [ebx+4]").unwrap();
        assert_eq!(render_no_labels(&modrm), vec![0b01_010_011, 4]);
    }

    #[test]
    fn disp32_only() {
        let modrm = parse_operands("eax, [1000]").unwrap();
        let bytes = render_no_labels(&modrm);
        assert_eq!(bytes[0], 0b00_000_101);
        assert_eq!(&bytes[1..], &1000i32.to_le_bytes());
    }
}
