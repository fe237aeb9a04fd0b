//! Fixup application. Patches the 4-byte fields named by each input's relocation entries so that
//! the bytes are correct once contributions sit at their final addresses.
//!
//! For a symbol defined in the same file, the emitter already encoded a segment-relative value,
//! so the patch adds only the shift the merged layout introduced. For an external symbol the
//! encoded field is zero and the patch supplies the full absolute address or PC-relative
//! displacement. Fields are big-endian and arithmetic wraps mod 2^32, which is how negative
//! displacements are carried.
//!
//! Entries are independent of each other; we process them in command-line and declaration order
//! so that output is reproducible.

use crate::error::Result;
use crate::layout::Layout;
use crate::object_file::RelocationEntry;
use crate::object_file::RelocationKind;
use crate::object_file::SegmentIndex;
use crate::object_file::SymbolKind;
use crate::output_segment_id::OutputSegmentId;
use crate::parsing::InputObject;
use crate::resolution::GlobalSymbolTable;
use anyhow::bail;
use tracing::debug;

#[tracing::instrument(skip_all, name = "Apply fixups")]
pub(crate) fn apply_fixups(
    inputs: &mut [InputObject],
    globals: &GlobalSymbolTable,
    layout: &Layout,
) -> Result {
    for input_index in 0..inputs.len() {
        let num_relocations = inputs[input_index].object.relocations.len();
        for relocation_index in 0..num_relocations {
            let input = &inputs[input_index];
            let relocation = input.object.relocations[relocation_index];
            let value = relocation_value(input, relocation, globals, layout)?;
            patch(&mut inputs[input_index], relocation, value)?;
        }
    }
    Ok(())
}

/// The value to wrapping-add to the encoded field, per relocation kind and whether the referenced
/// symbol is defined in the same file as the fixup.
fn relocation_value(
    input: &InputObject,
    relocation: RelocationEntry,
    globals: &GlobalSymbolTable,
    layout: &Layout,
) -> Result<u32> {
    let symbol = input.object.symbol(relocation.symbol);
    let defined_here = symbol.kind == SymbolKind::Defined;

    match relocation.kind {
        RelocationKind::Absolute4 => {
            if defined_here {
                let segment_of_symbol = symbol_segment(input, relocation, layout)?;
                let base = contribution_address(input, segment_of_symbol, layout)?;
                Ok(base as u32)
            } else {
                Ok(global_value(input, &symbol.name, globals)? as u32)
            }
        }
        RelocationKind::Relative4 => {
            let segment_of_fixup = fixup_segment(input, relocation, layout)?;
            let fixup_base = contribution_address(input, segment_of_fixup, layout)?;
            if defined_here {
                let segment_of_symbol = symbol_segment(input, relocation, layout)?;
                if segment_of_symbol == segment_of_fixup {
                    // The intra-segment displacement the emitter encoded is still correct.
                    Ok(0)
                } else {
                    let symbol_base = contribution_address(input, segment_of_symbol, layout)?;
                    Ok((symbol_base as u32).wrapping_sub(fixup_base as u32))
                }
            } else {
                let target = global_value(input, &symbol.name, globals)?;
                let site = fixup_base + relocation.loc;
                Ok((target as u32).wrapping_sub(site as u32))
            }
        }
    }
}

fn patch(input: &mut InputObject, relocation: RelocationEntry, value: u32) -> Result {
    let file = input.path.display().to_string();
    let segment = &mut input.object.segments[relocation.segment.as_usize()];
    let loc = relocation.loc as usize;
    let Some(field) = loc
        .checked_add(4)
        .and_then(|end| segment.data.get_mut(loc..end))
    else {
        bail!(
            "{file}: relocation at {:#x} in segment `{}` is outside its {} bytes of data",
            relocation.loc,
            segment.name,
            segment.data.len(),
        );
    };
    let old = u32::from_be_bytes((&*field).try_into()?);
    let new = old.wrapping_add(value);
    field.copy_from_slice(&new.to_be_bytes());
    debug!(
        file = %file,
        segment = %segment.name,
        loc = %format!("{:#x}", relocation.loc),
        old = %format!("{old:#010x}"),
        new = %format!("{new:#010x}"),
        "applied fixup",
    );
    Ok(())
}

/// The merged segment holding the bytes the fixup patches.
fn fixup_segment(
    input: &InputObject,
    relocation: RelocationEntry,
    layout: &Layout,
) -> Result<OutputSegmentId> {
    merged_segment(input, relocation.segment, layout)
}

/// The merged segment the referenced symbol is defined relative to. Only meaningful when the
/// symbol is defined in this file.
fn symbol_segment(
    input: &InputObject,
    relocation: RelocationEntry,
    layout: &Layout,
) -> Result<OutputSegmentId> {
    let symbol = input.object.symbol(relocation.symbol);
    let Some(index) = symbol.segment else {
        bail!(
            "{}: relocation against `{}` needs its defining segment, but the symbol is absolute",
            input.name(),
            symbol.name,
        );
    };
    merged_segment(input, index, layout)
}

fn merged_segment(
    input: &InputObject,
    index: SegmentIndex,
    layout: &Layout,
) -> Result<OutputSegmentId> {
    let Some(id) = layout.output_segments.id_by_index(index) else {
        bail!(
            "{}: segment number {} is not in the output segment table",
            input.name(),
            index.segnum(),
        );
    };
    Ok(id)
}

fn contribution_address(input: &InputObject, id: OutputSegmentId, layout: &Layout) -> Result<u64> {
    let Some(contribution) = layout.contribution(id, input.file_id) else {
        bail!(
            "{}: no contribution to merged segment `{}`",
            input.name(),
            layout.output_segments.name(id),
        );
    };
    Ok(contribution.address)
}

fn global_value(input: &InputObject, name: &str, globals: &GlobalSymbolTable) -> Result<u64> {
    let Some(resolved) = globals.get(name) else {
        bail!("{}: symbol `{name}` is not defined", input.name());
    };
    Ok(resolved.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;
    use crate::parsing::InputObject;
    use crate::parsing::input_from_str;
    use crate::resolution::resolve_symbols;

    fn link_fixups(inputs: &mut [InputObject]) -> Result {
        let layout = layout::compute(inputs);
        let globals = resolve_symbols(inputs, &layout)?;
        apply_fixups(inputs, &globals, &layout)
    }

    fn field(input: &InputObject, segment: usize, loc: usize) -> u32 {
        let data = &input.object.segments[segment].data;
        u32::from_be_bytes(data[loc..loc + 4].try_into().unwrap())
    }

    // Cross-file absolute reference: the undefined side's zero field receives the full resolved
    // address.
    #[test]
    fn test_absolute_fixup_against_external_symbol() {
        let a = input_from_str(
            0,
            "a.lk",
            "LINK\n1 1 0\n.text 0 8 RP\nfoo 4 1 D\n0000000000000000\n",
        );
        let b = input_from_str(
            1,
            "b.lk",
            "LINK\n1 1 1\n.text 0 8 RP\nfoo 0 0 U\n2 1 1 A4\n0000000000000000\n",
        );
        let mut inputs = [a, b];
        link_fixups(&mut inputs).unwrap();

        // a's .text is at 0x1000, so foo is at 0x1004.
        assert_eq!(field(&inputs[1], 0, 2), 0x0000_1004);
        // a's own data is untouched.
        assert_eq!(field(&inputs[0], 0, 0), 0);
    }

    // Intra-segment relative jump: the encoded displacement is already correct.
    #[test]
    fn test_relative_fixup_same_segment_unchanged() {
        let a = input_from_str(
            0,
            "a.lk",
            "LINK\n1 1 1\n.text 0 20 RP\ntarget 10 1 D\n4 1 1 R4\n\
             000000000000000c000000000000000000000000\n",
        );
        let mut inputs = [a];
        link_fixups(&mut inputs).unwrap();
        assert_eq!(field(&inputs[0], 0, 4), 0x0000_000c);
    }

    // Cross-segment relative reference within one file: the field moves by the difference of the
    // two contribution bases.
    #[test]
    fn test_relative_fixup_across_segments() {
        let a = input_from_str(
            0,
            "a.lk",
            "LINK\n2 1 1\n.text 0 4 RP\n.data 0 16 RWP\ndata_item 8 2 D\n0 1 1 R4\n\
             00000008\n00000000000000000000000000000000\n",
        );
        let mut inputs = [a];
        link_fixups(&mut inputs).unwrap();
        // .text at 0x1000, .data at 0x2000: 0x8 + (0x2000 - 0x1000) = 0x1008.
        assert_eq!(field(&inputs[0], 0, 0), 0x0000_1008);
    }

    // External relative reference where the target sits below the patch site: the displacement
    // wraps as two's complement.
    #[test]
    fn test_relative_fixup_wraps_negative_displacement() {
        let a = input_from_str(
            0,
            "a.lk",
            "LINK\n2 1 1\n.text 0 4 RP\n.data 0 8 RWP\next 0 0 U\n0 2 1 R4\n\
             00000000\n0000000000000000\n",
        );
        let b = input_from_str(1, "b.lk", "LINK\n1 1 0\n.text 0 4 RP\next 0 1 D\n00000000\n");
        let mut inputs = [a, b];
        link_fixups(&mut inputs).unwrap();
        // ext resolves to 0x1004 (b's .text contribution follows a's); the patch site is .data's
        // base 0x2000.
        assert_eq!(field(&inputs[0], 1, 0), 0xffff_f004);
    }

    // A locally-defined symbol referenced absolutely: the segment-relative encoding gains the
    // contribution's base.
    #[test]
    fn test_absolute_fixup_against_local_symbol() {
        let a = input_from_str(0, "a.lk", "LINK\n1 0 0\n.text 0 8 RP\n0000000000000000\n");
        let b = input_from_str(
            1,
            "b.lk",
            "LINK\n1 1 1\n.text 0 8 RP\nlbl 2 1 D\n0 1 1 A4\n0000000200000000\n",
        );
        let mut inputs = [a, b];
        link_fixups(&mut inputs).unwrap();
        // b's .text contribution starts at 0x1008.
        assert_eq!(field(&inputs[1], 0, 0), 0x0000_100a);
    }

    #[test]
    fn test_fixup_out_of_bounds() {
        let a = input_from_str(
            0,
            "a.lk",
            "LINK\n1 1 1\n.text 0 8 RP\nt 0 1 D\n6 1 1 A4\n0000000000000000\n",
        );
        let mut inputs = [a];
        let err = link_fixups(&mut inputs).unwrap_err();
        assert!(err.to_string().contains("outside its 8 bytes"));
    }
}
