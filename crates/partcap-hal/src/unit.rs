//! Guest processing units and their hash-MMU page-size menus.
//!
//! Each [`ProcessingUnit`] carries the list of segment base page sizes it
//! can use and, for each segment size, the actual page sizes allowed inside
//! it.  Capability handling narrows this menu with
//! [`ProcessingUnit::filter_page_sizes`].

/// Shift of the one "large page" size allowed inside smaller segments
/// (16 MiB).
pub const LARGE_PAGE_SHIFT: u32 = 24;

/// Page sizes usable inside segments of one base page size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPageSizes {
    /// Base page shift of the segment.
    pub seg_shift: u32,
    /// Actual page shifts allowed in the segment, ascending.
    pub page_shifts: Vec<u32>,
}

impl SegmentPageSizes {
    pub fn new(seg_shift: u32, page_shifts: &[u32]) -> Self {
        Self {
            seg_shift,
            page_shifts: page_shifts.to_vec(),
        }
    }
}

/// The default menu of a 64-bit hash-MMU server processor.
pub fn default_page_sizes() -> Vec<SegmentPageSizes> {
    vec![
        SegmentPageSizes::new(12, &[12, 16, 24]),
        SegmentPageSizes::new(16, &[16, 24]),
        SegmentPageSizes::new(24, &[24]),
        SegmentPageSizes::new(34, &[34]),
    ]
}

/// One virtual CPU of the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingUnit {
    index: usize,
    segments: Vec<SegmentPageSizes>,
}

impl ProcessingUnit {
    /// A unit with the default page-size menu.
    pub fn new(index: usize) -> Self {
        Self::with_page_sizes(index, default_page_sizes())
    }

    pub fn with_page_sizes(index: usize, segments: Vec<SegmentPageSizes>) -> Self {
        Self { index, segments }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn page_sizes(&self) -> &[SegmentPageSizes] {
        &self.segments
    }

    /// `true` when pages of `page_shift` are allowed in segments of
    /// `seg_shift`.
    pub fn allows(&self, seg_shift: u32, page_shift: u32) -> bool {
        self.segments
            .iter()
            .any(|s| s.seg_shift == seg_shift && s.page_shifts.contains(&page_shift))
    }

    /// Narrow the page-size menu with `keep(seg_shift, page_shift)`.
    ///
    /// A segment whose own base size is rejected is dropped entirely;
    /// otherwise only the rejected page sizes inside it are removed.
    pub fn filter_page_sizes<F>(&mut self, keep: F)
    where
        F: Fn(u32, u32) -> bool,
    {
        self.segments.retain_mut(|seg| {
            if !keep(seg.seg_shift, seg.seg_shift) {
                return false;
            }
            let seg_shift = seg.seg_shift;
            seg.page_shifts.retain(|&p| keep(seg_shift, p));
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_menu_allows_large_pages_in_small_segments() {
        let unit = ProcessingUnit::new(0);
        assert!(unit.allows(12, 24));
        assert!(unit.allows(16, 16));
        assert!(!unit.allows(16, 12));
    }

    #[test]
    fn filter_keeping_everything_is_identity() {
        let mut unit = ProcessingUnit::new(3);
        unit.filter_page_sizes(|_, _| true);
        assert_eq!(unit.page_sizes(), default_page_sizes().as_slice());
        assert_eq!(unit.index(), 3);
    }

    #[test]
    fn rejected_segment_base_drops_whole_segment() {
        let mut unit = ProcessingUnit::new(0);
        unit.filter_page_sizes(|seg, _| seg != 24);
        assert!(unit.page_sizes().iter().all(|s| s.seg_shift != 24));
        assert_eq!(unit.page_sizes().len(), 3);
    }

    #[test]
    fn rejected_page_removed_inside_segment() {
        let mut unit = ProcessingUnit::new(0);
        unit.filter_page_sizes(|_, p| p != 16);
        let seg4k = &unit.page_sizes()[0];
        assert_eq!(seg4k.page_shifts, vec![12, 24]);
        // 64k segment base is 16, so the segment itself disappears.
        assert!(!unit.page_sizes().iter().any(|s| s.seg_shift == 16));
    }
}
