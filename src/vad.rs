//! VAD Walker (C5): in-order traversal of a process's Virtual Address
//! Descriptor tree, producing the segment map a Dump Job persists.
//!
//! Grounded on `vmi-os-windows`'s `WindowsRegion`/`WindowsControlArea`/
//! `WindowsFileObject` (`comps/region.rs`, `comps/control_area.rs`,
//! `comps/object/file.rs`) for field layout and the fast-reference-tag
//! mask on `_CONTROL_AREA.FilePointer`, and on its `enumerate_tree_node_v2`
//! for traversal order — but reworked from recursion into an explicit
//! worklist per SPEC_FULL.md §9's redesign flag, and driven by a
//! [`VadVisitor`] rather than an `FnMut` callback so the traversal is
//! reusable outside dump capture (see the same section's visitor flag).

use tracing::warn;
use vmi_core::{AddressContext, Pa, Va, VmiCore, driver::VmiRead};

use crate::{error::Result, profile::KernelProfile};

/// One node of the guest's VAD tree, with its flags decoded and its
/// backing filename resolved.
#[derive(Debug, Clone)]
pub struct VadNode {
    /// First virtual address covered by this VAD.
    pub base: Va,
    /// Size, in bytes, of the range `[base, base + size)`.
    pub size: u64,
    /// Raw `_MMVAD_FLAGS.VadType` value.
    pub vad_type: u8,
    /// Raw `_MMVAD_FLAGS.Protection` value (`MM_*` constants).
    pub protection: u8,
    /// `_MMVAD_FLAGS.PrivateMemory`.
    pub is_private: bool,
    /// Whether this VAD is a thread stack. Always `false` in this build;
    /// see `DESIGN.md`, Open Question resolution 5.
    pub is_stack: bool,
    /// Backing file name, if the VAD maps a section with a file object.
    pub filename: Option<String>,
}

/// Receives each node the walker visits, in ascending base-address order.
///
/// Returning `false` stops the traversal early (used by tests that only
/// want the first few nodes); the production path always returns `true`
/// and relies on the walker's own segment cap to bound work.
pub trait VadVisitor {
    /// Called once per VAD node, in in-order (ascending address) sequence.
    fn visit(&mut self, node: VadNode) -> bool;
}

/// Walks the VAD tree rooted at `vad_root`, feeding each node to `visitor`.
///
/// Traversal is left-subtree → node → right-subtree, using an explicit
/// stack rather than recursion: the `cap` below is then a clean early exit
/// rather than a bound on stack depth. Stops after `cap` nodes have been
/// visited, logging a warning — this is the "segment cap exceeded" policy
/// in SPEC_FULL.md §7, not an error. A child pointer that fails to read is
/// logged and that subtree is skipped, per the "VAD tree corruption" policy
/// in the same table. A node whose base or end address resolves to 0 is
/// skipped silently and does not count against the cap.
pub fn walk<Driver>(
    vmi: &VmiCore<Driver>,
    profile: &KernelProfile,
    root: Pa,
    vad_root: Va,
    cap: usize,
    visitor: &mut impl VadVisitor,
) where
    Driver: VmiRead,
{
    if vad_root.is_null() {
        return;
    }

    let mut visited = 0usize;
    let mut stack = Vec::new();
    let mut current = Some(vad_root);

    loop {
        while let Some(node) = current {
            stack.push(node);
            current = match read_child(vmi, profile, root, node, Side::Left) {
                Ok(child) => child,
                Err(err) => {
                    warn!(%err, node = ?node, "failed to read left VAD child; skipping subtree");
                    None
                }
            };
        }

        let Some(node) = stack.pop() else {
            return;
        };

        if visited >= cap {
            warn!(cap, "VAD segment cap exceeded; dropping remaining VADs");
            return;
        }

        match build_node(vmi, profile, root, node) {
            Ok(Some(vad)) => {
                visited += 1;
                if !visitor.visit(vad) {
                    return;
                }
            }
            Ok(None) => {
                // Zero-extent VAD (base or end resolves to address 0); not a
                // real range, skip without counting against the cap.
            }
            Err(err) => {
                warn!(%err, node = ?node, "failed to read VAD node; skipping");
            }
        }

        current = match read_child(vmi, profile, root, node, Side::Right) {
            Ok(child) => child,
            Err(err) => {
                warn!(%err, node = ?node, "failed to read right VAD child; skipping subtree");
                None
            }
        };
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Left,
    Right,
}

fn read_child<Driver>(
    vmi: &VmiCore<Driver>,
    profile: &KernelProfile,
    root: Pa,
    node: Va,
    side: Side,
) -> Result<Option<Va>>
where
    Driver: VmiRead,
{
    let mmvad_short = &profile.offsets._MMVAD_SHORT;
    let field = match side {
        Side::Left => &mmvad_short.Left,
        Side::Right => &mmvad_short.Right,
    };

    let child = Va(vmi.read_field(AddressContext::new(node, root), field)?);
    Ok(if child.is_null() { None } else { Some(child) })
}

fn build_node<Driver>(
    vmi: &VmiCore<Driver>,
    profile: &KernelProfile,
    root: Pa,
    node: Va,
) -> Result<Option<VadNode>>
where
    Driver: VmiRead,
{
    let mmvad_short = &profile.offsets._MMVAD_SHORT;
    let mmvad_flags = &profile.offsets._MMVAD_FLAGS;
    let ctx = AddressContext::new(node, root);

    let starting_vpn_low = vmi.read_field(ctx, &mmvad_short.StartingVpn)?;
    let starting_vpn_high = match &mmvad_short.StartingVpnHigh {
        Some(field) => vmi.read_field(ctx, field)?,
        None => 0,
    };
    let starting_vpn = (starting_vpn_high << 32) | starting_vpn_low;

    let ending_vpn_low = vmi.read_field(ctx, &mmvad_short.EndingVpn)?;
    let ending_vpn_high = match &mmvad_short.EndingVpnHigh {
        Some(field) => vmi.read_field(ctx, field)?,
        None => 0,
    };
    let ending_vpn = (ending_vpn_high << 32) | ending_vpn_low;

    let base = Va(starting_vpn << 12);
    let end = Va(ending_vpn << 12);
    if base.0 == 0 || end.0 == 0 {
        return Ok(None);
    }
    let size = end.0.saturating_sub(base.0);

    let vad_flags = vmi.read_field(ctx, &mmvad_short.VadFlags)?;
    let vad_type = mmvad_flags.VadType.value_from(vad_flags) as u8;
    let protection = mmvad_flags.Protection.value_from(vad_flags) as u8;
    let is_private = mmvad_flags.PrivateMemory.value_from(vad_flags) != 0;

    let filename = read_filename(vmi, profile, root, node).unwrap_or_else(|err| {
        warn!(%err, node = ?node, "failed to resolve VAD backing filename");
        None
    });

    Ok(Some(VadNode {
        base,
        size,
        vad_type,
        protection,
        is_private,
        is_stack: false,
        filename,
    }))
}

/// Resolves the backing filename for a VAD node, if any: node → `_MMVAD`
/// subsection → `_SUBSECTION` control area → `_CONTROL_AREA` file object
/// (masking the fast-reference tag) → `_FILE_OBJECT` filename.
fn read_filename<Driver>(
    vmi: &VmiCore<Driver>,
    profile: &KernelProfile,
    root: Pa,
    node: Va,
) -> Result<Option<String>>
where
    Driver: VmiRead,
{
    let offsets = &profile.offsets;

    let subsection = Va(vmi.read_field(AddressContext::new(node, root), &offsets._MMVAD.Subsection)?);
    if subsection.is_null() {
        return Ok(None);
    }

    let control_area = Va(vmi.read_field(
        AddressContext::new(subsection, root),
        &offsets._SUBSECTION.ControlArea,
    )?);
    if control_area.is_null() {
        return Ok(None);
    }

    let fast_ref = vmi.read_field(
        AddressContext::new(control_area, root),
        &offsets._CONTROL_AREA.FilePointer,
    )?;
    let mask = (1u64 << offsets._EX_FAST_REF.RefCnt.bit_length()) - 1;
    let file_object = Va(fast_ref & !mask);
    if file_object.is_null() {
        return Ok(None);
    }

    read_unicode_string(vmi, profile, root, file_object, &offsets._FILE_OBJECT.FileName).map(Some)
}

/// Reads a `_UNICODE_STRING` at `base + offset`, decoding its UTF-16 buffer.
///
/// Mirrors `vmi-os-windows`'s `WindowsOs::read_unicode_string64` idiom: two
/// raw reads (the inline `Length`/`Buffer` fields, then the out-of-line
/// wide-character buffer) rather than going through a cached struct reader.
fn read_unicode_string<Driver>(
    vmi: &VmiCore<Driver>,
    profile: &KernelProfile,
    root: Pa,
    base: Va,
    offset: &isr_macros::Field,
) -> Result<String>
where
    Driver: VmiRead,
{
    let unicode_string = &profile.offsets._UNICODE_STRING;
    let ctx = AddressContext::new(base + offset.offset(), root);

    let length = vmi.read_field(ctx, &unicode_string.Length)?;
    let buffer = Va(vmi.read_field(ctx, &unicode_string.Buffer)?);

    let mut bytes = vec![0u8; length as usize];
    vmi.read(AddressContext::new(buffer, root), &mut bytes)?;

    Ok(String::from_utf16_lossy(
        &bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect::<Vec<_>>(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<VadNode>);

    impl VadVisitor for Collect {
        fn visit(&mut self, node: VadNode) -> bool {
            self.0.push(node);
            true
        }
    }

    #[test]
    fn collect_counts_visited_nodes() {
        let mut collector = Collect(Vec::new());
        collector.visit(VadNode {
            base: Va(0x1000),
            size: 0x1000,
            vad_type: 2,
            protection: 3,
            is_private: false,
            is_stack: false,
            filename: Some("ntdll.dll".into()),
        });
        assert_eq!(collector.0.len(), 1);
        assert_eq!(collector.0[0].filename.as_deref(), Some("ntdll.dll"));
    }

    #[test]
    fn null_root_is_handled_by_the_caller_check() {
        assert!(Va(0).is_null());
        assert!(!Va(0x1000).is_null());
    }
}
