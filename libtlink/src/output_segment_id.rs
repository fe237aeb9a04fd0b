//! Identity of the merged segments in the output file.
//!
//! The output segment table always starts with `.text`, `.data` and `.bss`, in that order.
//! Segment names we don't have built-in IDs for are appended in the order we first see them
//! across the inputs, carrying the flags of their first contribution.

use crate::object_file::SegmentFlags;
use crate::object_file::SegmentIndex;
use hashbrown::HashMap;

/// An ID for a merged output segment. Also its position in the output segment table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct OutputSegmentId(u32);

pub(crate) const TEXT: OutputSegmentId = OutputSegmentId(0);
pub(crate) const DATA: OutputSegmentId = OutputSegmentId(1);
pub(crate) const BSS: OutputSegmentId = OutputSegmentId(2);

pub(crate) const NUM_BUILT_IN_SEGMENTS: usize = 3;

pub(crate) struct BuiltInSegmentDetails {
    pub(crate) name: &'static str,
    pub(crate) flags: SegmentFlags,
}

const SEGMENT_DEFINITIONS: [BuiltInSegmentDetails; NUM_BUILT_IN_SEGMENTS] = [
    BuiltInSegmentDetails {
        name: ".text",
        flags: SegmentFlags::READABLE.union(SegmentFlags::PRESENT),
    },
    BuiltInSegmentDetails {
        name: ".data",
        flags: SegmentFlags::READABLE
            .union(SegmentFlags::WRITABLE)
            .union(SegmentFlags::PRESENT),
    },
    BuiltInSegmentDetails {
        name: ".bss",
        flags: SegmentFlags::READABLE.union(SegmentFlags::WRITABLE),
    },
];

#[derive(Debug)]
pub(crate) struct SegmentInfo {
    pub(crate) name: String,
    pub(crate) flags: SegmentFlags,
}

pub(crate) struct OutputSegments {
    segment_infos: Vec<SegmentInfo>,
    custom_by_name: HashMap<String, OutputSegmentId>,
}

impl OutputSegments {
    pub(crate) fn new() -> OutputSegments {
        let segment_infos = SEGMENT_DEFINITIONS
            .iter()
            .map(|d| SegmentInfo {
                name: d.name.to_owned(),
                flags: d.flags,
            })
            .collect();
        OutputSegments {
            segment_infos,
            custom_by_name: HashMap::new(),
        }
    }

    /// Returns the ID for `name`, appending a new merged segment with `flags` if this is the
    /// first time we've seen the name. Contributions to a segment we already know, built-in or
    /// not, never change its flags.
    pub(crate) fn add_segment(&mut self, name: &str, flags: SegmentFlags) -> OutputSegmentId {
        if let Some(id) = self.id_by_name(name) {
            return id;
        }
        let id = OutputSegmentId(self.segment_infos.len() as u32);
        self.segment_infos.push(SegmentInfo {
            name: name.to_owned(),
            flags,
        });
        self.custom_by_name.insert(name.to_owned(), id);
        id
    }

    pub(crate) fn id_by_name(&self, name: &str) -> Option<OutputSegmentId> {
        SEGMENT_DEFINITIONS
            .iter()
            .position(|d| d.name == name)
            .map(|raw| OutputSegmentId(raw as u32))
            .or_else(|| self.custom_by_name.get(name).copied())
    }

    /// Translates a segnum that refers to the output segment table. This is how symbols and
    /// relocations name their segments once the merged table exists.
    pub(crate) fn id_by_index(&self, index: SegmentIndex) -> Option<OutputSegmentId> {
        (index.as_usize() < self.segment_infos.len())
            .then(|| OutputSegmentId(index.as_usize() as u32))
    }

    pub(crate) fn info(&self, id: OutputSegmentId) -> &SegmentInfo {
        &self.segment_infos[id.as_usize()]
    }

    pub(crate) fn name(&self, id: OutputSegmentId) -> &str {
        &self.info(id).name
    }

    pub(crate) fn num_segments(&self) -> usize {
        self.segment_infos.len()
    }

    pub(crate) fn ids(&self) -> impl ExactSizeIterator<Item = OutputSegmentId> + use<> {
        (0..self.segment_infos.len() as u32).map(OutputSegmentId)
    }
}

impl OutputSegmentId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for OutputSegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Verifies that our constants for segment IDs match their respective offsets in
/// `SEGMENT_DEFINITIONS`.
#[test]
fn test_constant_ids() {
    let check = [(TEXT, ".text"), (DATA, ".data"), (BSS, ".bss")];
    for (id, name) in check {
        assert_eq!(SEGMENT_DEFINITIONS[id.as_usize()].name, name);
    }
    assert_eq!(NUM_BUILT_IN_SEGMENTS, check.len());
}

#[test]
fn test_custom_segments_appended_in_first_seen_order() {
    let mut segments = OutputSegments::new();
    let rodata = segments.add_segment(".rodata", SegmentFlags::READABLE | SegmentFlags::PRESENT);
    let debug = segments.add_segment(".debug", SegmentFlags::READABLE);
    assert_eq!(rodata.as_usize(), NUM_BUILT_IN_SEGMENTS);
    assert_eq!(debug.as_usize(), NUM_BUILT_IN_SEGMENTS + 1);

    // A second contribution with different flags maps to the same segment and leaves the first
    // contribution's flags in place.
    let again = segments.add_segment(".rodata", SegmentFlags::WRITABLE);
    assert_eq!(again, rodata);
    assert_eq!(
        segments.info(rodata).flags,
        SegmentFlags::READABLE | SegmentFlags::PRESENT
    );
}

#[test]
fn test_built_in_lookup() {
    let segments = OutputSegments::new();
    assert_eq!(segments.id_by_name(".text"), Some(TEXT));
    assert_eq!(segments.id_by_name(".bss"), Some(BSS));
    assert_eq!(segments.id_by_name(".rodata"), None);
    assert_eq!(
        segments.id_by_index(SegmentIndex::from_segnum(2).unwrap()),
        Some(DATA)
    );
    assert_eq!(segments.id_by_index(SegmentIndex::from_segnum(9).unwrap()), None);
}
