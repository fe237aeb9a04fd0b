//! In-memory representation of an object file in the textual LINK format. Inputs are parsed into
//! this and the linked output is emitted from it.
//!
//! The on-disk format numbers segments and symbols starting at 1. That encoding is translated at
//! the I/O boundary; everything in memory is 0-based through the index newtypes below.

use crate::error::Result;
use anyhow::bail;
use std::fmt::Display;

pub(crate) const MAGIC: &str = "LINK";

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct SegmentFlags: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Present segments carry data bytes in the file. `.bss` is never present.
        const PRESENT = 1 << 2;
    }
}

impl SegmentFlags {
    pub(crate) fn parse(flags: &str) -> Result<SegmentFlags> {
        let mut out = SegmentFlags::empty();
        for letter in flags.chars() {
            out |= match letter {
                'R' => SegmentFlags::READABLE,
                'W' => SegmentFlags::WRITABLE,
                'P' => SegmentFlags::PRESENT,
                other => bail!("unknown segment flag `{other}`"),
            };
        }
        Ok(out)
    }
}

impl Display for SegmentFlags {
    /// Flag order in the format is unspecified, so we canonicalise to R, W, P to keep output
    /// byte-stable.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.contains(SegmentFlags::READABLE) {
            f.write_str("R")?;
        }
        if self.contains(SegmentFlags::WRITABLE) {
            f.write_str("W")?;
        }
        if self.contains(SegmentFlags::PRESENT) {
            f.write_str("P")?;
        }
        Ok(())
    }
}

/// 0-based index into an object's segment table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SegmentIndex(usize);

impl SegmentIndex {
    pub(crate) fn from_usize(value: usize) -> SegmentIndex {
        SegmentIndex(value)
    }

    /// Translates a 1-based on-disk segnum. Zero means absolute/undefined, which has no index.
    pub(crate) fn from_segnum(segnum: u64) -> Option<SegmentIndex> {
        (segnum > 0).then(|| SegmentIndex(segnum as usize - 1))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0
    }

    pub(crate) fn segnum(self) -> u64 {
        self.0 as u64 + 1
    }
}

/// 0-based index into an object's symbol table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SymbolIndex(usize);

impl SymbolIndex {
    pub(crate) fn from_ref(r: u64) -> Option<SymbolIndex> {
        (r > 0).then(|| SymbolIndex(r as usize - 1))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0
    }

    pub(crate) fn symbol_ref(self) -> u64 {
        self.0 as u64 + 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Segment {
    pub(crate) name: String,
    pub(crate) start_address: u64,
    pub(crate) length: u64,
    pub(crate) flags: SegmentFlags,
    /// Raw bytes for present segments, empty otherwise. Fixups patch these in place.
    pub(crate) data: Vec<u8>,
}

impl Segment {
    pub(crate) fn is_present(&self) -> bool {
        self.flags.contains(SegmentFlags::PRESENT)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SymbolKind {
    Defined,
    Undefined,
}

impl SymbolKind {
    pub(crate) fn parse(kind: &str) -> Result<SymbolKind> {
        match kind {
            "D" => Ok(SymbolKind::Defined),
            "U" => Ok(SymbolKind::Undefined),
            other => bail!("unknown symbol kind `{other}`"),
        }
    }
}

impl Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SymbolKind::Defined => "D",
            SymbolKind::Undefined => "U",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Symbol {
    pub(crate) name: String,
    /// Segment-relative in inputs. The resolver computes the absolute value; it never writes it
    /// back here.
    pub(crate) value: u64,
    /// The segment the symbol is defined relative to. `None` for absolute or undefined symbols
    /// (segnum 0 on disk).
    pub(crate) segment: Option<SegmentIndex>,
    pub(crate) kind: SymbolKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelocationKind {
    /// Four-byte absolute address.
    Absolute4,
    /// Four-byte PC-relative displacement.
    Relative4,
}

impl RelocationKind {
    pub(crate) fn parse(kind: &str) -> Result<RelocationKind> {
        match kind {
            "A4" => Ok(RelocationKind::Absolute4),
            "R4" => Ok(RelocationKind::Relative4),
            other => bail!("unknown relocation kind `{other}`"),
        }
    }
}

impl Display for RelocationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RelocationKind::Absolute4 => "A4",
            RelocationKind::Relative4 => "R4",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RelocationEntry {
    /// Byte offset of the field to patch, within the data of `segment`.
    pub(crate) loc: u64,
    pub(crate) segment: SegmentIndex,
    /// The symbol the fixup resolves against.
    pub(crate) symbol: SymbolIndex,
    pub(crate) kind: RelocationKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ObjectFile {
    pub(crate) segments: Vec<Segment>,
    pub(crate) symbols: Vec<Symbol>,
    pub(crate) relocations: Vec<RelocationEntry>,
}

impl ObjectFile {
    pub(crate) fn segment(&self, index: SegmentIndex) -> &Segment {
        &self.segments[index.as_usize()]
    }

    pub(crate) fn symbol(&self, index: SymbolIndex) -> &Symbol {
        &self.symbols[index.as_usize()]
    }
}

#[test]
fn test_flags_round_trip_canonical() {
    let flags = SegmentFlags::parse("PWR").unwrap();
    assert_eq!(flags, SegmentFlags::all());
    assert_eq!(flags.to_string(), "RWP");
    assert_eq!(SegmentFlags::parse("RW").unwrap().to_string(), "RW");
}

#[test]
fn test_unknown_flag_letter() {
    let err = SegmentFlags::parse("RX").unwrap_err();
    assert!(err.to_string().contains('X'));
}

#[test]
fn test_index_translation() {
    assert_eq!(SegmentIndex::from_segnum(0), None);
    assert_eq!(SegmentIndex::from_segnum(1), Some(SegmentIndex(0)));
    assert_eq!(SegmentIndex(2).segnum(), 3);
    assert_eq!(SymbolIndex::from_ref(0), None);
    assert_eq!(SymbolIndex::from_ref(4).unwrap().as_usize(), 3);
}
