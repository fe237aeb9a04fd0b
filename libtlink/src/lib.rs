//! A linker for a simple, line-oriented textual object format. Merges the segments of the input
//! objects into page-aligned output segments, resolves symbols to absolute addresses, applies
//! fixups to the segment data, then writes the laid-out result as a single object.

mod alignment;
pub mod args;
pub mod error;
mod fixup;
mod input_data;
mod layout;
mod object_file;
mod object_writer;
mod output_segment_id;
mod parsing;
mod resolution;
pub mod timing;

use crate::args::Args;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::parsing::InputObject;

#[tracing::instrument(skip_all, name = "Link")]
pub fn link(args: &Args) -> Result {
    let input_data = input_data::InputData::from_args(args)?;
    let mut inputs = parsing::parse_inputs(&input_data)?;
    let output = link_objects(&mut inputs)?;
    object_writer::write_output_file(&args.output, &output)
}

/// Runs the link proper on already-parsed inputs: allocation, then symbol resolution, then
/// fixups, then assembly of the output object. Everything short of file I/O.
fn link_objects(inputs: &mut [InputObject]) -> Result<ObjectFile> {
    let layout = layout::compute(inputs);
    let global_symbols = resolution::resolve_symbols(inputs, &layout)?;
    fixup::apply_fixups(inputs, &global_symbols, &layout)?;
    Ok(object_writer::assemble_output(inputs, &layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::input_from_str;

    // Two files linked end to end: an absolute reference from b to a symbol in a lands in the
    // assembled .text bytes.
    #[test]
    fn test_link_two_objects() {
        let a = input_from_str(
            0,
            "a.lk",
            "LINK\n1 1 0\n.text 0 8 RP\nfoo 4 1 D\n1111111111111111\n",
        );
        let b = input_from_str(
            1,
            "b.lk",
            "LINK\n1 1 1\n.text 0 8 RP\nfoo 0 0 U\n2 1 1 A4\n2222000000002222\n",
        );
        let mut inputs = [a, b];
        let output = link_objects(&mut inputs).unwrap();

        let text = &output.segments[0];
        assert_eq!(text.start_address, 0x1000);
        assert_eq!(text.length, 16);
        // a's bytes untouched, then b's with the field at offset 2 patched to foo's address.
        assert_eq!(
            text.data,
            [
                0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, //
                0x22, 0x22, 0x00, 0x00, 0x10, 0x04, 0x22, 0x22,
            ]
        );
    }

    // An input with no symbols and no relocations links to an object whose only content is data
    // segments.
    #[test]
    fn test_link_data_only_object() {
        let a = input_from_str(0, "a.lk", "LINK\n2 0 0\n.text 0 4 RP\n.data 0 2 RWP\ndeadbeef\nffff\n");
        let mut inputs = [a];
        let output = link_objects(&mut inputs).unwrap();

        assert!(output.symbols.is_empty());
        assert!(output.relocations.is_empty());
        assert_eq!(output.segments[0].data, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(output.segments[1].data, [0xff, 0xff]);
    }

    // A single input is a valid link unit; the seeded table still shapes the output.
    #[test]
    fn test_link_single_input() {
        let a = input_from_str(0, "a.lk", "LINK\n1 1 0\n.text 0 8 RP\nmain 0 1 D\n0011223344556677\n");
        let mut inputs = [a];
        let output = link_objects(&mut inputs).unwrap();

        assert_eq!(output.segments.len(), 3);
        assert_eq!(output.segments[0].start_address, 0x1000);
    }
}
