//! Kernel-structure field offsets, read-only and loaded once.
//!
//! Field layout mirrors the subset of `_EPROCESS`/`_MMVAD`/`_CONTROL_AREA`/
//! `_FILE_OBJECT` that `vmi-os-windows` declares for its own Windows support
//! (`crates/vmi-os-windows/src/offsets/mod.rs`), narrowed to exactly the
//! symbolic field keys named in the profile-input contract: process
//! descriptor {PID, top-level PT root, VAD root, image file name}, VAD node
//! {left/right child, starting/ending VPN, flags word, control area}, control
//! area {file object}, file object {filename}, flags bit-ranges {VAD type,
//! is-private, protection}.

use std::path::Path;

use isr_core::Profile as RawProfile;
use isr_macros::{Bitfield, Field, offsets, symbols};

use crate::error::{Result, UnpackError};

offsets! {
    /// Field offsets consumed by the Paging Mirror, VAD Walker, and Process
    /// Tracker.
    #[derive(Debug)]
    pub struct Offsets {
        struct _LIST_ENTRY {
            Flink: Field,
            Blink: Field,
        }

        struct _EX_FAST_REF {
            RefCnt: Bitfield,
            Value: Field,
        }

        struct _UNICODE_STRING {
            Length: Field,
            MaximumLength: Field,
            Buffer: Field,
        }

        struct _KPROCESS {
            DirectoryTableBase: Field,
        }

        struct _EPROCESS {
            UniqueProcessId: Field,
            ActiveProcessLinks: Field,  // _LIST_ENTRY
            InheritedFromUniqueProcessId: Field,
            ImageFileName: Field,
            VadRoot: Field,             // _RTL_AVL_TREE / _MM_AVL_TABLE
        }

        struct _MMVAD_FLAGS {
            VadType: Bitfield,
            Protection: Bitfield,
            PrivateMemory: Bitfield,
        }

        struct _MMVAD_SHORT {
            #[isr(alias = "LeftChild")]
            Left: Field,
            #[isr(alias = "RightChild")]
            Right: Field,
            StartingVpn: Field,
            EndingVpn: Field,
            StartingVpnHigh: Option<Field>,
            EndingVpnHigh: Option<Field>,
            VadFlags: Field,            // _MMVAD_FLAGS
        }

        struct _MMVAD {
            Subsection: Field,          // _SUBSECTION*
        }

        struct _SUBSECTION {
            ControlArea: Field,         // _CONTROL_AREA*
        }

        struct _CONTROL_AREA {
            FilePointer: Field,         // _EX_FAST_REF (tagged _FILE_OBJECT*)
        }

        struct _FILE_OBJECT {
            FileName: Field,            // _UNICODE_STRING
        }
    }
}

symbols! {
    /// Kernel globals consumed by the Process Tracker (C7).
    #[derive(Debug)]
    pub struct Symbols {
        PsActiveProcessHead: u64,
        PsInitialSystemProcess: u64,
    }
}

/// The loaded, read-only kernel profile: raw field offsets plus the handful
/// of kernel globals the tracker needs to find the process list.
pub struct KernelProfile {
    /// Field-offset tables.
    pub offsets: Offsets,
    /// Kernel global addresses.
    pub symbols: Symbols,
    /// The unparsed profile, kept around because `vmi_os_windows::WindowsOs::new`
    /// needs its own (much larger) view of the same file.
    pub raw: RawProfile,
}

/// Loads a [`KernelProfile`] from a JSON-encoded `isr_core::Profile` file.
///
/// This bypasses the introspection library's own `isr::cache::IsrCache` +
/// codeview-identification flow (see `DESIGN.md`, Open Question 4): the CLI
/// surface takes a flat profile path rather than a kernel binary to
/// identify against a cache directory.
pub fn load_profile(path: impl AsRef<Path>) -> Result<KernelProfile> {
    let path = path.as_ref();

    let file = std::fs::File::open(path).map_err(|source| UnpackError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let raw: RawProfile =
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|source| {
            UnpackError::Profile {
                path: path.to_path_buf(),
                source,
            }
        })?;

    let offsets = Offsets::new(&raw)?;
    let symbols = Symbols::new(&raw)?;

    Ok(KernelProfile { offsets, symbols, raw })
}
