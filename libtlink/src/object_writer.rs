//! Emits objects in the textual LINK format and assembles the linked output object from the
//! layout and the fixed-up inputs.

use crate::error::Context as _;
use crate::error::Result;
use crate::layout::Layout;
use crate::object_file::MAGIC;
use crate::object_file::ObjectFile;
use crate::object_file::Segment;
use crate::object_file::SegmentFlags;
use crate::parsing::InputObject;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write as _;
use std::path::Path;

/// Builds the output object: the merged segment table at its final addresses and, for each
/// present merged segment, its contributions' bytes concatenated in input order. Grouping by
/// merged segment here is what keeps the data correct when input segment order differs from the
/// output table's.
#[tracing::instrument(skip_all, name = "Assemble output")]
pub(crate) fn assemble_output(inputs: &[InputObject], layout: &Layout) -> ObjectFile {
    let segments = layout
        .output_segments
        .ids()
        .map(|id| {
            let info = layout.output_segments.info(id);
            let merged = layout.segment_layout(id);
            let mut data = Vec::new();
            if info.flags.contains(SegmentFlags::PRESENT) {
                data.reserve(merged.length as usize);
                for contribution in &merged.contributions {
                    let source = inputs[contribution.file_id.as_usize()]
                        .object
                        .segment(contribution.source);
                    if source.is_present() {
                        data.extend_from_slice(&source.data);
                    } else {
                        // A non-present input segment still occupies its span of the merged
                        // segment, so its bytes are zero.
                        data.resize(data.len() + contribution.length as usize, 0);
                    }
                }
            }
            Segment {
                name: info.name.clone(),
                start_address: merged.base_address,
                length: merged.length,
                flags: info.flags,
                data,
            }
        })
        .collect();

    ObjectFile {
        segments,
        symbols: Vec::new(),
        relocations: Vec::new(),
    }
}

pub(crate) fn write_object(out: &mut impl std::io::Write, object: &ObjectFile) -> Result {
    writeln!(out, "{MAGIC}")?;
    writeln!(
        out,
        "{} {} {}",
        object.segments.len(),
        object.symbols.len(),
        object.relocations.len()
    )?;

    writeln!(out, "# segments")?;
    for segment in &object.segments {
        writeln!(
            out,
            "{} {:x} {} {}",
            segment.name, segment.start_address, segment.length, segment.flags
        )?;
    }

    writeln!(out, "# symbols")?;
    for symbol in &object.symbols {
        let segnum = symbol.segment.map_or(0, |index| index.segnum());
        writeln!(
            out,
            "{} {:x} {segnum} {}",
            symbol.name, symbol.value, symbol.kind
        )?;
    }

    writeln!(out, "# relocations")?;
    for relocation in &object.relocations {
        writeln!(
            out,
            "{:x} {} {} {}",
            relocation.loc,
            relocation.segment.segnum(),
            relocation.symbol.symbol_ref(),
            relocation.kind
        )?;
    }

    writeln!(out, "# segment data")?;
    for segment in &object.segments {
        // A present segment of length 0 gets no line: the format ignores blank lines, so an
        // empty hex line could not be read back.
        if segment.is_present() && !segment.data.is_empty() {
            writeln!(out, "{}", hex::encode(&segment.data))?;
        }
    }

    Ok(())
}

#[tracing::instrument(skip_all, name = "Write output file")]
pub(crate) fn write_output_file(path: &Path, object: &ObjectFile) -> Result {
    let file = File::create(path)
        .with_context(|| format!("Failed to open output file `{}`", path.display()))?;
    let mut out = BufWriter::new(file);
    write_object(&mut out, object)
        .with_context(|| format!("Failed writing output file `{}`", path.display()))?;
    out.flush()
        .with_context(|| format!("Failed writing output file `{}`", path.display()))?;
    make_executable(out.get_ref())
        .with_context(|| format!("Failed to make `{}` executable", path.display()))?;
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn make_executable(file: &File) -> Result {
    use std::os::unix::prelude::PermissionsExt;

    let mut permissions = file.metadata()?.permissions();
    let mut mode = PermissionsExt::mode(&permissions);
    // Set execute permission wherever we currently have read permission.
    mode |= (mode & 0o444) >> 2;
    PermissionsExt::set_mode(&mut permissions, mode);
    file.set_permissions(permissions)?;
    Ok(())
}

#[cfg(target_os = "windows")]
#[allow(clippy::unnecessary_wraps)]
fn make_executable(_file: &File) -> Result {
    // There are no executable permissions on Windows.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;
    use crate::parsing::input_from_str;
    use crate::parsing::object_from_str;

    fn written(object: &ObjectFile) -> String {
        let mut out = Vec::new();
        write_object(&mut out, object).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_round_trip_is_identity() {
        let text = "LINK\n\
                    3 2 2\n\
                    .text 1000 8 RP\n.data 0 4 RWP\n.bss 0 16 RW\n\
                    main 0 1 D\nputs 0 0 U\n\
                    2 1 2 A4\n4 1 1 R4\n\
                    0011223344556677\ncafebabe\n";
        let object = object_from_str(text).unwrap();
        let first = written(&object);
        let reparsed = object_from_str(&first).unwrap();
        assert_eq!(reparsed, object);
        // And the second emission is byte-identical to the first.
        assert_eq!(written(&reparsed), first);
    }

    #[test]
    fn test_flag_order_is_canonicalised() {
        let object = object_from_str("LINK\n1 0 0\n.data 0 2 PWR\nbeef\n").unwrap();
        let out = written(&object);
        assert!(out.contains(".data 0 2 RWP\n"));
    }

    #[test]
    fn test_section_markers_present() {
        let object = object_from_str("LINK\n0 0 0\n").unwrap();
        let out = written(&object);
        for marker in ["# segments", "# symbols", "# relocations", "# segment data"] {
            assert!(out.contains(marker), "missing `{marker}` in {out:?}");
        }
    }

    #[test]
    fn test_assemble_groups_contributions_by_merged_segment() {
        // b declares its segments in the opposite order; grouping by merged segment must put
        // each contribution with its own kind.
        let a = input_from_str(
            0,
            "a.lk",
            "LINK\n2 0 0\n.text 0 2 RP\n.data 0 2 RWP\n1111\naaaa\n",
        );
        let b = input_from_str(
            1,
            "b.lk",
            "LINK\n2 0 0\n.data 0 2 RWP\n.text 0 2 RP\nbbbb\n2222\n",
        );
        let inputs = [a, b];
        let layout = layout::compute(&inputs);
        let output = assemble_output(&inputs, &layout);

        assert_eq!(output.segments[0].name, ".text");
        assert_eq!(output.segments[0].data, [0x11, 0x11, 0x22, 0x22]);
        assert_eq!(output.segments[1].name, ".data");
        assert_eq!(output.segments[1].data, [0xaa, 0xaa, 0xbb, 0xbb]);
    }

    #[test]
    fn test_assemble_output_table_and_addresses() {
        let a = input_from_str(
            0,
            "a.lk",
            "LINK\n3 0 0\n.text 0 4 RP\n.data 0 2 RWP\n.bss 0 8 RW\ndeadbeef\ncafe\n",
        );
        let inputs = [a];
        let layout = layout::compute(&inputs);
        let output = assemble_output(&inputs, &layout);

        // The seeded table survives into the output in order, fully laid out.
        let names: Vec<&str> = output.segments.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, [".text", ".data", ".bss"]);
        assert_eq!(output.segments[0].start_address, 0x1000);
        assert_eq!(output.segments[1].start_address, 0x2000);
        assert_eq!(output.segments[2].start_address, 0x3000);
        assert_eq!(output.segments[2].length, 8);
        // .bss is never present and emits no data.
        assert!(!output.segments[2].is_present());
        assert!(output.segments[2].data.is_empty());
        assert!(output.symbols.is_empty());
        assert!(output.relocations.is_empty());
    }

    #[test]
    fn test_non_present_contribution_zero_fills() {
        let a = input_from_str(0, "a.lk", "LINK\n1 0 0\n.data 0 2 RWP\nf00d\n");
        // b's .data carries no bytes of its own but still occupies 4 bytes of the merged
        // segment.
        let b = input_from_str(1, "b.lk", "LINK\n1 0 0\n.data 0 4 RW\n");
        let inputs = [a, b];
        let layout = layout::compute(&inputs);
        let output = assemble_output(&inputs, &layout);

        assert_eq!(output.segments[1].data, [0xf0, 0x0d, 0, 0, 0, 0]);
        assert_eq!(output.segments[1].length, 6);
    }
}
