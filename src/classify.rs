//! Page Classifier (C3): decides what kind of memory a faulting page
//! belongs to, which in turn drives the Trap Controller's filter policy.
//!
//! Grounded on `vmi-os-windows`'s `WindowsRegion::protection`/`vad_type`
//! (`comps/region.rs`), specifically its `MM_*` protection-constant table
//! and the `VadImageMap` check against `_MMVAD.VadType` — reused here
//! as the raw `MMVAD_FLAGS.Protection`/`VadType` values read straight off
//! our own `profile::Offsets`, not through `vmi-os-windows`'s
//! `VmiOsRegion` trait object.

use crate::vad::VadNode;

/// A page's classification, decided once per fault from the VAD node that
/// contains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Backed by an image section and mapped into the image region.
    Library,
    /// Marked as (or lying within) a thread stack.
    Stack,
    /// Private, non-image memory (typically the heap).
    Heap,
    /// Executable, image-backed page.
    Code,
    /// Anything else with a known VAD.
    Data,
    /// No VAD could be found for the address.
    Unknown,
}

/// Raw value of `_MMVAD_FLAGS.VadType` that marks an image-backed mapping.
///
/// Mirrors `vmi-os-windows`'s `VadImageMap` constant in `comps/region.rs`.
const VAD_TYPE_IMAGE: u8 = 2;

/// Raw `_MMVAD_FLAGS.Protection` values, taken from `WindowsRegion::protection`.
mod mm_protection {
    pub const EXECUTE: u8 = 2;
    pub const EXECUTE_READ: u8 = 3;
    pub const EXECUTE_READWRITE: u8 = 6;
    pub const EXECUTE_WRITECOPY: u8 = 7;
}

/// Classifies a page given the VAD node that contains it, if any, and
/// whether the leaf page-table entry marks it executable.
///
/// Rules are evaluated in the order given in SPEC_FULL.md §4.3; the first
/// match wins.
pub fn classify(vad: Option<&VadNode>, page_executable: bool) -> Category {
    let Some(vad) = vad else {
        return Category::Unknown;
    };

    if vad.filename.is_some() && vad.vad_type == VAD_TYPE_IMAGE {
        return Category::Library;
    }

    if vad.is_stack {
        return Category::Stack;
    }

    if vad.is_private && vad.vad_type != VAD_TYPE_IMAGE {
        return Category::Heap;
    }

    if vad.vad_type == VAD_TYPE_IMAGE && page_executable {
        return Category::Code;
    }

    Category::Data
}

/// Whether `category` currently participates in the W→X machine, given the
/// run's include flags.
///
/// Default policy (all three flags `false`): only `CODE` and `UNKNOWN`
/// pages are instrumented.
pub fn is_instrumented(
    category: Category,
    include_library: bool,
    include_heap: bool,
    include_stack: bool,
) -> bool {
    match category {
        Category::Code | Category::Unknown => true,
        Category::Library => include_library,
        Category::Heap => include_heap,
        Category::Stack => include_stack,
        Category::Data => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vad(vad_type: u8, is_private: bool, is_stack: bool, filename: Option<&str>) -> VadNode {
        VadNode {
            base: vmi_core::Va(0),
            size: 0x1000,
            vad_type,
            protection: mm_protection::EXECUTE_READ,
            is_private,
            is_stack,
            filename: filename.map(String::from),
        }
    }

    #[test]
    fn image_backed_node_with_filename_is_library() {
        let v = vad(VAD_TYPE_IMAGE, false, false, Some("ntdll.dll"));
        assert_eq!(classify(Some(&v), true), Category::Library);
    }

    #[test]
    fn private_non_image_is_heap() {
        let v = vad(1, true, false, None);
        assert_eq!(classify(Some(&v), false), Category::Heap);
    }

    #[test]
    fn image_executable_without_filename_is_code() {
        let v = vad(VAD_TYPE_IMAGE, false, false, None);
        assert_eq!(classify(Some(&v), true), Category::Code);
    }

    #[test]
    fn no_vad_is_unknown() {
        assert_eq!(classify(None, true), Category::Unknown);
    }

    #[test]
    fn default_policy_instruments_only_code_and_unknown() {
        assert!(is_instrumented(Category::Code, false, false, false));
        assert!(is_instrumented(Category::Unknown, false, false, false));
        assert!(!is_instrumented(Category::Library, false, false, false));
        assert!(!is_instrumented(Category::Heap, false, false, false));
        assert!(!is_instrumented(Category::Stack, false, false, false));
        assert!(is_instrumented(Category::Library, true, false, false));
    }
}
