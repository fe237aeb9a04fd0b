//! Storage allocation. Merges like-named segments from all inputs into the output segment table,
//! records where each input's contribution lands inside its merged segment, then walks the table
//! assigning page-aligned base addresses.
//!
//! Contribution offsets and absolute addresses are separate fields filled by separate passes, so
//! no field ever means two different things depending on linker phase.

use crate::alignment::PAGE_SIZE;
use crate::alignment::align_up;
use crate::input_data::FileId;
use crate::object_file::Segment;
use crate::object_file::SegmentIndex;
use crate::output_segment_id::NUM_BUILT_IN_SEGMENTS;
use crate::output_segment_id::OutputSegmentId;
use crate::output_segment_id::OutputSegments;
use crate::parsing::InputObject;
use tracing::debug;

/// The first page is reserved for the header, so the first merged segment loads at the second
/// page.
const FIRST_SEGMENT_ADDRESS: u64 = 0x1000;

/// One input file's portion of a merged output segment.
#[derive(Debug)]
pub(crate) struct Contribution {
    pub(crate) file_id: FileId,
    /// The segment within the contributing input that these bytes come from.
    pub(crate) source: SegmentIndex,
    /// Byte offset of this contribution inside its merged segment: the sum of the lengths of the
    /// contributions that precede it.
    pub(crate) offset: u64,
    pub(crate) length: u64,
    /// Absolute start address in the output address space. Filled by `apply_bases` once the
    /// merged segment has a base.
    pub(crate) address: u64,
}

/// Size and placement of one merged output segment, with its contributions in input order.
#[derive(Debug, Default)]
pub(crate) struct SegmentLayout {
    pub(crate) base_address: u64,
    pub(crate) length: u64,
    pub(crate) contributions: Vec<Contribution>,
}

pub(crate) struct Layout {
    pub(crate) output_segments: OutputSegments,
    /// Indexed by `OutputSegmentId`.
    pub(crate) segment_layouts: Vec<SegmentLayout>,
}

#[tracing::instrument(skip_all, name = "Storage allocation")]
pub(crate) fn compute(inputs: &[InputObject]) -> Layout {
    let mut output_segments = OutputSegments::new();
    let mut segment_layouts: Vec<SegmentLayout> = Vec::with_capacity(NUM_BUILT_IN_SEGMENTS);
    segment_layouts.resize_with(NUM_BUILT_IN_SEGMENTS, SegmentLayout::default);

    for input in inputs {
        for (index, segment) in input.object.segments.iter().enumerate() {
            merge_contribution(
                &mut output_segments,
                &mut segment_layouts,
                input.file_id,
                SegmentIndex::from_usize(index),
                segment,
            );
        }
    }

    debug!(
        merged_segments = output_segments.num_segments(),
        "merged input segments",
    );
    assign_bases(&mut segment_layouts, &output_segments);
    apply_bases(&mut segment_layouts);

    Layout {
        output_segments,
        segment_layouts,
    }
}

fn merge_contribution(
    output_segments: &mut OutputSegments,
    segment_layouts: &mut Vec<SegmentLayout>,
    file_id: FileId,
    source: SegmentIndex,
    segment: &Segment,
) {
    let id = output_segments.add_segment(&segment.name, segment.flags);
    if id.as_usize() == segment_layouts.len() {
        segment_layouts.push(SegmentLayout::default());
    }
    let merged = &mut segment_layouts[id.as_usize()];
    merged.contributions.push(Contribution {
        file_id,
        source,
        offset: merged.length,
        length: segment.length,
        address: 0,
    });
    merged.length += segment.length;
}

/// Lays the merged segments out at successive page boundaries. Empty merged segments keep their
/// entry and receive a base like any other.
fn assign_bases(segment_layouts: &mut [SegmentLayout], output_segments: &OutputSegments) {
    let mut address = FIRST_SEGMENT_ADDRESS;
    for (id, merged) in output_segments.ids().zip(segment_layouts.iter_mut()) {
        merged.base_address = align_up(address, PAGE_SIZE);
        address = merged.base_address + merged.length;
        debug!(
            segment = output_segments.name(id),
            base = %format!("{:#x}", merged.base_address),
            length = merged.length,
            "placed merged segment",
        );
    }
}

/// Makes every contribution's address absolute now that merged bases are known.
fn apply_bases(segment_layouts: &mut [SegmentLayout]) {
    for merged in segment_layouts {
        for contribution in &mut merged.contributions {
            contribution.address = merged.base_address + contribution.offset;
        }
    }
}

impl Layout {
    pub(crate) fn segment_layout(&self, id: OutputSegmentId) -> &SegmentLayout {
        &self.segment_layouts[id.as_usize()]
    }

    /// The allocation-table lookup: where did `file_id`'s part of merged segment `id` land?
    pub(crate) fn contribution(&self, id: OutputSegmentId, file_id: FileId) -> Option<&Contribution> {
        self.segment_layout(id)
            .contributions
            .iter()
            .find(|c| c.file_id == file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output_segment_id;
    use crate::parsing::input_from_str;

    #[test]
    fn test_two_inputs_merge_text() {
        let a = input_from_str(0, "a.lk", "LINK\n1 0 0\n.text 0 8 RP\n1122334455667788\n");
        let b = input_from_str(1, "b.lk", "LINK\n1 0 0\n.text 0 4 RP\naabbccdd\n");
        let layout = compute(&[a, b]);

        let text = layout.segment_layout(output_segment_id::TEXT);
        assert_eq!(text.base_address, 0x1000);
        assert_eq!(text.length, 12);

        let first = layout
            .contribution(output_segment_id::TEXT, FileId::new(0))
            .unwrap();
        let second = layout
            .contribution(output_segment_id::TEXT, FileId::new(1))
            .unwrap();
        assert_eq!(first.address, 0x1000);
        assert_eq!(second.offset, 8);
        assert_eq!(second.address, 0x1008);
    }

    #[test]
    fn test_contribution_address_is_base_plus_prior_lengths() {
        let inputs: Vec<_> = (0..3)
            .map(|i| {
                input_from_str(
                    i,
                    &format!("in{i}.lk"),
                    "LINK\n1 0 0\n.data 0 6 RWP\n000000000000\n",
                )
            })
            .collect();
        let layout = compute(&inputs);

        let data = layout.segment_layout(output_segment_id::DATA);
        let mut expected_offset = 0;
        for contribution in &data.contributions {
            assert_eq!(contribution.offset, expected_offset);
            assert_eq!(contribution.address, data.base_address + expected_offset);
            expected_offset += contribution.length;
        }
        assert_eq!(data.length, expected_offset);
    }

    #[test]
    fn test_successive_page_aligned_bases() {
        // .data is longer than a page, so .bss lands two pages after it.
        let input = input_from_str(
            0,
            "a.lk",
            "LINK\n4 0 0\n\
             .text 0 8 RP\n.data 0 4100 RW\n.bss 0 16 RW\n.rodata 0 5 RP\n\
             1122334455667788\n0000000000\n",
        );
        let layout = compute(&[input]);

        let bases: Vec<u64> = layout
            .segment_layouts
            .iter()
            .map(|s| s.base_address)
            .collect();
        assert_eq!(bases, [0x1000, 0x2000, 0x4000, 0x5000]);

        // No merged segment may overlap the one before it, and every base is page-aligned.
        let mut previous_end = 0;
        for merged in &layout.segment_layouts {
            assert_eq!(merged.base_address % PAGE_SIZE, 0);
            assert!(merged.base_address >= previous_end);
            previous_end = merged.base_address + merged.length;
        }
    }

    #[test]
    fn test_seeded_table_present_for_single_input() {
        let input = input_from_str(0, "a.lk", "LINK\n1 0 0\n.text 0 4 RP\ndeadbeef\n");
        let layout = compute(&[input]);

        assert_eq!(layout.output_segments.num_segments(), 3);
        assert_eq!(layout.segment_layout(output_segment_id::DATA).length, 0);
        assert_eq!(layout.segment_layout(output_segment_id::BSS).length, 0);
    }

    #[test]
    fn test_empty_segment_participates() {
        let input = input_from_str(0, "a.lk", "LINK\n2 0 0\n.text 0 0 RP\n.data 0 4 RWP\ncafebabe\n");
        let layout = compute(&[input]);

        let text = layout
            .contribution(output_segment_id::TEXT, FileId::new(0))
            .unwrap();
        assert_eq!(text.length, 0);
        assert_eq!(text.address, 0x1000);
    }

    #[test]
    fn test_custom_segment_keeps_first_contribution_flags() {
        use crate::object_file::SegmentFlags;

        let a = input_from_str(0, "a.lk", "LINK\n1 0 0\n.rodata 0 2 RP\nbeef\n");
        let b = input_from_str(1, "b.lk", "LINK\n1 0 0\n.rodata 0 2 RWP\nf00d\n");
        let layout = compute(&[a, b]);

        let id = layout.output_segments.id_by_name(".rodata").unwrap();
        assert_eq!(id.as_usize(), NUM_BUILT_IN_SEGMENTS);
        assert_eq!(
            layout.output_segments.info(id).flags,
            SegmentFlags::READABLE | SegmentFlags::PRESENT
        );
        assert_eq!(layout.segment_layout(id).length, 4);
    }
}
