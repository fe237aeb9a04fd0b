//! Parses the textual LINK object format into `ObjectFile`s.
//!
//! The format is line-oriented: the `LINK` magic, a counts line, then segment definitions, the
//! symbol table, the relocation table and one hex data line per present segment, in that order.
//! Comment lines (`#...`) and blank lines are ignored everywhere, which is also why a present
//! segment of length 0 has no data line at all.

use crate::error::Context as _;
use crate::error::Result;
use crate::input_data::FileId;
use crate::input_data::InputData;
use crate::object_file::MAGIC;
use crate::object_file::ObjectFile;
use crate::object_file::RelocationEntry;
use crate::object_file::RelocationKind;
use crate::object_file::Segment;
use crate::object_file::SegmentFlags;
use crate::object_file::SegmentIndex;
use crate::object_file::Symbol;
use crate::object_file::SymbolIndex;
use crate::object_file::SymbolKind;
use anyhow::bail;
use anyhow::ensure;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;

/// An input file together with its parsed contents.
pub(crate) struct InputObject {
    pub(crate) file_id: FileId,
    pub(crate) path: PathBuf,
    pub(crate) object: ObjectFile,
}

impl InputObject {
    pub(crate) fn name(&self) -> std::path::Display<'_> {
        self.path.display()
    }
}

#[tracing::instrument(skip_all, name = "Parse input files")]
pub(crate) fn parse_inputs(input_data: &InputData) -> Result<Vec<InputObject>> {
    input_data
        .files
        .iter()
        .map(|file| {
            let object = parse_object(&file.path, &file.text)?;
            Ok(InputObject {
                file_id: file.file_id,
                path: file.path.clone(),
                object,
            })
        })
        .collect()
}

pub(crate) fn parse_object(path: &Path, text: &str) -> Result<ObjectFile> {
    let mut lines = Lines::new(path, text);

    let magic = lines.next_line("the file magic")?;
    if magic != MAGIC {
        bail!(
            "{}: invalid magic `{magic}`, expected `{MAGIC}`",
            path.display()
        );
    }

    let header = lines.next_line("the header counts")?;
    let (segment_num, symbol_num, relocation_num) = parse_counts(header)
        .with_context(|| format!("{}: malformed header `{header}`", path.display()))?;

    let mut object = ObjectFile::default();

    for _ in 0..segment_num {
        let line = lines.next_line("segment definitions")?;
        let segment = parse_segment_line(line).with_context(|| {
            format!("{}: malformed segment definition `{line}`", path.display())
        })?;
        object.segments.push(segment);
    }

    for _ in 0..symbol_num {
        let line = lines.next_line("the symbol table")?;
        let symbol = parse_symbol_line(line)
            .with_context(|| format!("{}: malformed symbol `{line}`", path.display()))?;
        if let Some(segment) = symbol.segment {
            ensure!(
                segment.as_usize() < object.segments.len(),
                "{}: symbol `{}` references segment number {}, which is not in this object",
                path.display(),
                symbol.name,
                segment.segnum(),
            );
        }
        object.symbols.push(symbol);
    }

    for _ in 0..relocation_num {
        let line = lines.next_line("the relocation table")?;
        let relocation = parse_relocation_line(line)
            .with_context(|| format!("{}: malformed relocation `{line}`", path.display()))?;
        ensure!(
            relocation.segment.as_usize() < object.segments.len(),
            "{}: relocation `{line}` references segment number {}, which is not in this object",
            path.display(),
            relocation.segment.segnum(),
        );
        ensure!(
            relocation.symbol.as_usize() < object.symbols.len(),
            "{}: relocation `{line}` references symbol number {}, which is not in this object",
            path.display(),
            relocation.symbol.symbol_ref(),
        );
        object.relocations.push(relocation);
    }

    for segment in &mut object.segments {
        if !segment.is_present() || segment.length == 0 {
            continue;
        }
        let line = lines.next_line("segment data")?;
        let data = hex::decode(line.trim()).with_context(|| {
            format!(
                "{}: malformed hex data for segment `{}`",
                path.display(),
                segment.name
            )
        })?;
        ensure!(
            data.len() as u64 == segment.length,
            "{}: segment `{}` declares length {} but its data line carries {} bytes",
            path.display(),
            segment.name,
            segment.length,
            data.len(),
        );
        segment.data = data;
    }

    debug!(
        file = %path.display(),
        segments = object.segments.len(),
        symbols = object.symbols.len(),
        relocations = object.relocations.len(),
        "parsed object",
    );

    Ok(object)
}

/// Iterates the meaningful lines of an object file, skipping comments and blank lines.
struct Lines<'data> {
    path: &'data Path,
    inner: std::str::Lines<'data>,
}

impl<'data> Lines<'data> {
    fn new(path: &'data Path, text: &'data str) -> Lines<'data> {
        Lines {
            path,
            inner: text.lines(),
        }
    }

    fn next_line(&mut self, reading: &str) -> Result<&'data str> {
        for line in self.inner.by_ref() {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            return Ok(line);
        }
        bail!(
            "{}: unexpected end of file while reading {reading}",
            self.path.display()
        );
    }
}

fn parse_counts(line: &str) -> Result<(u64, u64, u64)> {
    let mut fields = line.split_whitespace();
    let segment_num = dec_field(&mut fields, "segment count")?;
    let symbol_num = dec_field(&mut fields, "symbol count")?;
    let relocation_num = dec_field(&mut fields, "relocation count")?;
    Ok((segment_num, symbol_num, relocation_num))
}

fn parse_segment_line(line: &str) -> Result<Segment> {
    let mut fields = line.split_whitespace();
    let name = fields.next().context("missing segment name")?;
    let start_address = hex_field(&mut fields, "start address")?;
    let length = dec_field(&mut fields, "length")?;
    let flags = SegmentFlags::parse(fields.next().context("missing segment flags")?)?;
    Ok(Segment {
        name: name.to_owned(),
        start_address,
        length,
        flags,
        data: Vec::new(),
    })
}

fn parse_symbol_line(line: &str) -> Result<Symbol> {
    let mut fields = line.split_whitespace();
    let name = fields.next().context("missing symbol name")?;
    let value = hex_field(&mut fields, "value")?;
    let segnum = dec_field(&mut fields, "segment number")?;
    let kind = SymbolKind::parse(fields.next().context("missing symbol kind")?)?;
    Ok(Symbol {
        name: name.to_owned(),
        value,
        segment: SegmentIndex::from_segnum(segnum),
        kind,
    })
}

fn parse_relocation_line(line: &str) -> Result<RelocationEntry> {
    let mut fields = line.split_whitespace();
    let loc = hex_field(&mut fields, "location")?;
    let segnum = dec_field(&mut fields, "segment number")?;
    let segment = SegmentIndex::from_segnum(segnum).context("segment number must be >= 1")?;
    let r = dec_field(&mut fields, "symbol reference")?;
    let symbol = SymbolIndex::from_ref(r).context("symbol reference must be >= 1")?;
    let kind = RelocationKind::parse(fields.next().context("missing relocation kind")?)?;
    Ok(RelocationEntry {
        loc,
        segment,
        symbol,
        kind,
    })
}

fn hex_field(fields: &mut std::str::SplitWhitespace<'_>, what: &str) -> Result<u64> {
    let field = fields.next().with_context(|| format!("missing {what}"))?;
    u64::from_str_radix(field, 16).with_context(|| format!("invalid {what} `{field}`"))
}

fn dec_field(fields: &mut std::str::SplitWhitespace<'_>, what: &str) -> Result<u64> {
    let field = fields.next().with_context(|| format!("missing {what}"))?;
    field
        .parse()
        .with_context(|| format!("invalid {what} `{field}`"))
}

#[cfg(test)]
pub(crate) fn object_from_str(text: &str) -> Result<ObjectFile> {
    parse_object(Path::new("test.lk"), text)
}

#[cfg(test)]
pub(crate) fn input_from_str(file_id: u32, path: &str, text: &str) -> InputObject {
    InputObject {
        file_id: FileId::new(file_id),
        path: PathBuf::from(path),
        object: parse_object(Path::new(path), text).unwrap(),
    }
}

#[cfg(test)]
const SMALL_OBJECT: &str = "\
LINK
# a deliberately commented-up file
3 2 1

.text 0 8 RP
.data 0 4 RWP
.bss 0 10 RW
main 0 1 D
printf 0 0 U
# relocations next
4 1 2 A4
# segment data
0011223344556677
cafebabe
";

#[test]
fn test_parse_small_object() {
    let object = object_from_str(SMALL_OBJECT).unwrap();
    assert_eq!(object.segments.len(), 3);
    assert_eq!(object.symbols.len(), 2);
    assert_eq!(object.relocations.len(), 1);

    let text = &object.segments[0];
    assert_eq!(text.name, ".text");
    assert_eq!(text.length, 8);
    assert_eq!(text.flags, SegmentFlags::READABLE | SegmentFlags::PRESENT);
    assert_eq!(text.data, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);

    let bss = &object.segments[2];
    assert_eq!(bss.length, 10);
    assert!(!bss.is_present());
    assert!(bss.data.is_empty());

    let main = &object.symbols[0];
    assert_eq!(main.kind, SymbolKind::Defined);
    assert_eq!(main.segment, Some(SegmentIndex::from_usize(0)));
    assert_eq!(object.symbols[1].segment, None);

    let rel = &object.relocations[0];
    assert_eq!(rel.loc, 4);
    assert_eq!(rel.segment.as_usize(), 0);
    assert_eq!(rel.symbol.as_usize(), 1);
    assert_eq!(rel.kind, RelocationKind::Absolute4);
}

#[test]
fn test_invalid_magic() {
    let err = object_from_str("ELF\n0 0 0\n").unwrap_err();
    assert!(err.to_string().contains("invalid magic"));
}

#[test]
fn test_unknown_relocation_code() {
    let text = "LINK\n1 1 1\n.text 0 4 RP\nfoo 0 1 D\n0 1 1 A8\ndeadbeef\n";
    let err = object_from_str(text).unwrap_err();
    assert!(format!("{err:#}").contains("unknown relocation kind `A8`"));
}

#[test]
fn test_data_length_mismatch() {
    let text = "LINK\n1 0 0\n.text 0 8 RP\ncafe\n";
    let err = object_from_str(text).unwrap_err();
    assert!(err.to_string().contains("declares length 8"));
}

#[test]
fn test_missing_data_line() {
    let err = object_from_str("LINK\n1 0 0\n.text 0 8 RP\n").unwrap_err();
    assert!(err.to_string().contains("end of file"));
}

#[test]
fn test_present_zero_length_segment_has_no_data_line() {
    let object = object_from_str("LINK\n1 0 0\n.text 0 0 RP\n").unwrap();
    assert!(object.segments[0].data.is_empty());
}

#[test]
fn test_symbol_segnum_out_of_range() {
    let err = object_from_str("LINK\n1 1 0\n.text 0 0 RP\nfoo 0 5 D\n").unwrap_err();
    assert!(err.to_string().contains("segment number 5"));
}

#[test]
fn test_relocation_ref_out_of_range() {
    let text = "LINK\n1 0 1\n.text 0 4 RP\n0 1 3 A4\n00000000\n";
    let err = object_from_str(text).unwrap_err();
    assert!(err.to_string().contains("symbol number 3"));
}

#[test]
fn test_malformed_header() {
    let err = object_from_str("LINK\n1 nope 0\n").unwrap_err();
    assert!(format!("{err:#}").contains("invalid symbol count"));
}
