//! Immutable run configuration.
//!
//! Replaces the process-wide mutable strings ("global configuration") the
//! source used for domain name, profile path, and output directory with a
//! single validated, immutable value threaded through every component's
//! constructor (see `DESIGN.md`, "Global configuration").

use std::path::PathBuf;

use crate::error::{Result, UnpackError};

/// Default cap on the number of memory segments collected into one dump job.
pub const DEFAULT_SEGMENT_CAP: usize = 1024;

/// Default capacity of the bounded dump queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// How the target virtual machine is reached.
#[derive(Debug, Clone)]
pub enum Target {
    /// Attach to a running domain by name.
    Domain(String),
    /// Analyze an offline crash dump file.
    DumpFile(PathBuf),
}

/// How the target process is identified within the guest.
#[derive(Debug, Clone)]
pub enum ProcessSelector {
    /// A specific process ID.
    Pid(u32),
    /// The (first) process matching this image name.
    Name(String),
}

/// Immutable, validated configuration for one run of the unpacker.
///
/// Constructed once, in [`Config::new`], and never mutated afterward. Every
/// component constructor takes a `&Config` rather than reading ambient
/// global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// The virtual machine to attach to.
    pub target: Target,
    /// Path to the JSON-encoded kernel profile.
    pub profile_path: PathBuf,
    /// Directory dump artifacts are written into.
    pub output_dir: PathBuf,
    /// The process to monitor.
    pub process: ProcessSelector,
    /// Whether child processes should be enlisted automatically.
    pub follow_children: bool,
    /// Whether pages classified as LIBRARY participate in the W→X machine.
    pub include_library: bool,
    /// Whether pages classified as HEAP participate in the W→X machine.
    pub include_heap: bool,
    /// Whether pages classified as STACK participate in the W→X machine.
    pub include_stack: bool,
    /// Maximum number of memory segments per dump job.
    pub segment_cap: usize,
    /// Capacity of the bounded dump queue.
    pub queue_capacity: usize,
}

impl Config {
    /// Validates and constructs a `Config`.
    ///
    /// Returns [`UnpackError::Config`] if the output directory cannot be
    /// created, or if `segment_cap`/`queue_capacity` are zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: Target,
        profile_path: PathBuf,
        output_dir: PathBuf,
        process: ProcessSelector,
        follow_children: bool,
        include_library: bool,
        include_heap: bool,
        include_stack: bool,
        segment_cap: usize,
        queue_capacity: usize,
    ) -> Result<Self> {
        if segment_cap == 0 {
            return Err(UnpackError::Config("segment-cap must be nonzero".into()));
        }

        if queue_capacity == 0 {
            return Err(UnpackError::Config("queue-capacity must be nonzero".into()));
        }

        std::fs::create_dir_all(&output_dir).map_err(|source| UnpackError::Io {
            path: output_dir.clone(),
            source,
        })?;

        Ok(Self {
            target,
            profile_path,
            output_dir,
            process,
            follow_children,
            include_library,
            include_heap,
            include_stack,
            segment_cap,
            queue_capacity,
        })
    }
}
