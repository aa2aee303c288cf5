//! CLI entrypoint: parses arguments into a [`vmi_unpack::Config`], attaches
//! to the target VM, resolves the monitored process, and runs the [`Engine`]
//! until a shutdown signal arrives.
//!
//! Grounded on `examples/windows-breakpoint-manager.rs`'s `main()`: same
//! `tracing_subscriber::fmt` + `signal_hook` shutdown-flag setup, same
//! kernel-discovery sequence (`VmiCore::registers` → `WindowsOs::find_kernel`
//! → profile load → `WindowsOs::new` → `VmiSession::new`). Unlike that
//! example, process resolution (kernel translation root, active-process-list
//! head, target PID/name lookup) happens before `session.handle` is entered,
//! because `tracker::resolve` can fail with an error that has no
//! `vmi_core::VmiError` equivalent, and `VmiSession::handle`'s factory
//! closure is hardcoded to that error type.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::AtomicBool,
    },
};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vmi_arch_amd64::Amd64;
use vmi_core::{VcpuId, VmiCore, VmiSession};
use vmi_os_windows::{WindowsOs, WindowsOsExt as _};

use vmi_unpack::{
    Config, Engine, UnpackError, load_profile,
    config::{ProcessSelector, Target},
    dump, tracker,
};

/// Hypervisor-assisted generic unpacker.
///
/// Watches a guest Windows process for write-then-execute page transitions
/// and dumps the written memory when it is about to run.
#[derive(Parser, Debug)]
#[command(name = "vmi-unpack", version, about)]
struct Cli {
    /// Name of the running Xen domain to attach to.
    #[arg(long, conflicts_with = "dump_file")]
    domain: Option<String>,

    /// Path to an offline kernel crash dump to analyze instead of a live domain.
    #[arg(long, conflicts_with = "domain")]
    dump_file: Option<PathBuf>,

    /// Path to the JSON-encoded kernel profile.
    #[arg(long)]
    profile: PathBuf,

    /// Directory dump artifacts are written into.
    #[arg(long)]
    output_dir: PathBuf,

    /// Process ID to monitor.
    #[arg(long, conflicts_with = "name")]
    pid: Option<u32>,

    /// Image name of the process to monitor (first match in list order wins).
    #[arg(long, conflicts_with = "pid")]
    name: Option<String>,

    /// Automatically enlist child processes of the monitored process.
    #[arg(long)]
    follow_children: bool,

    /// Include LIBRARY-classified pages in the write-then-execute machine.
    #[arg(long)]
    include_library: bool,

    /// Include HEAP-classified pages in the write-then-execute machine.
    #[arg(long)]
    include_heap: bool,

    /// Include STACK-classified pages in the write-then-execute machine.
    #[arg(long)]
    include_stack: bool,

    /// Maximum number of memory segments collected into one dump job.
    #[arg(long, default_value_t = vmi_unpack::config::DEFAULT_SEGMENT_CAP)]
    segment_cap: usize,

    /// Capacity of the bounded dump queue.
    #[arg(long, default_value_t = vmi_unpack::config::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Increase log verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn target(&self) -> Result<Target, UnpackError> {
        match (&self.domain, &self.dump_file) {
            (Some(domain), None) => Ok(Target::Domain(domain.clone())),
            (None, Some(path)) => Ok(Target::DumpFile(path.clone())),
            _ => Err(UnpackError::Config(
                "exactly one of --domain or --dump-file is required".into(),
            )),
        }
    }

    fn process(&self) -> Result<ProcessSelector, UnpackError> {
        match (self.pid, &self.name) {
            (Some(pid), None) => Ok(ProcessSelector::Pid(pid)),
            (None, Some(name)) => Ok(ProcessSelector::Name(name.clone())),
            _ => Err(UnpackError::Config(
                "exactly one of --pid or --name is required".into(),
            )),
        }
    }

    fn config(&self) -> Result<Config, UnpackError> {
        Config::new(
            self.target()?,
            self.profile.clone(),
            self.output_dir.clone(),
            self.process()?,
            self.follow_children,
            self.include_library,
            self.include_heap,
            self.include_stack,
            self.segment_cap,
            self.queue_capacity,
        )
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_env("VMI_UNPACK_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn install_shutdown_handler() -> Result<Arc<AtomicBool>, std::io::Error> {
    let terminate_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGHUP, terminate_flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, terminate_flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGALRM, terminate_flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, terminate_flag.clone())?;
    Ok(terminate_flag)
}

/// Resolves everything `Engine::new` needs but that `tracker::resolve` can
/// fail on: the kernel's translation root, the active-process-list head, and
/// the target process itself.
fn resolve_target<Driver>(
    core: &VmiCore<Driver>,
    session: &VmiSession<Driver, WindowsOs<Driver>>,
    profile: &vmi_unpack::KernelProfile,
    process: &ProcessSelector,
) -> Result<(vmi_core::Pa, vmi_core::Va, tracker::MonitoredProcess), UnpackError>
where
    Driver: vmi_core::driver::VmiFullDriver<Architecture = Amd64>,
{
    let _pause_guard = core.pause_guard()?;
    let registers = core.registers(VcpuId(0))?;
    let vmi = session.with_registers(&registers);

    let kernel_image_base = vmi.os().kernel_image_base()?;
    tracing::info!(%kernel_image_base, "found kernel");

    let system_process = vmi.os().system_process()?;
    let kernel_root = system_process.translation_root()?;
    tracing::info!(%kernel_root, "resolved kernel translation root");

    let list_head = kernel_image_base + profile.symbols.PsActiveProcessHead;

    let target = tracker::resolve(core, profile, kernel_root, list_head, process)?;
    tracing::info!(pid = %target.pid, name = %target.name, "resolved target process");

    Ok((kernel_root, list_head, target))
}

#[cfg(feature = "driver-xen")]
fn run_xen(config: Config, domain_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use vmi_driver_xen::VmiXenDriver;
    use xen::XenStore;

    let domain_id = XenStore::domain_id_from_name(domain_name)?
        .ok_or_else(|| UnpackError::Config(format!("domain {domain_name} not found")))?;
    tracing::debug!(?domain_id);

    let driver = VmiXenDriver::<Amd64>::new(domain_id)?;
    let core = VmiCore::new(driver)?;

    let registers = core.registers(VcpuId(0))?;
    let kernel_info =
        WindowsOs::find_kernel(&core, &registers)?.ok_or(UnpackError::ConnectionLost(
            "could not locate Windows kernel in guest memory".into(),
        ))?;
    tracing::info!(?kernel_info, "located kernel image");

    let profile = load_profile(&config.profile_path)?;
    let os = WindowsOs::<VmiXenDriver<Amd64>>::new(&profile.raw)?;
    let session = VmiSession::new(&core, &os);

    let (kernel_root, list_head, target) = resolve_target(&core, &session, &profile, &config.process)?;

    let terminate_flag = install_shutdown_handler()?;
    let (queue, writer) = dump::spawn(config.output_dir.clone(), config.queue_capacity);

    session.handle(|session| {
        Engine::new(
            session,
            &config,
            &profile,
            kernel_root,
            list_head,
            target,
            queue,
            terminate_flag,
        )
    })?;

    writer.join().ok();

    Ok(())
}

#[cfg(feature = "driver-kdmp")]
fn run_kdmp(config: Config, path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    use vmi_driver_kdmp::VmiKdmpDriver;

    let driver = VmiKdmpDriver::<Amd64>::new(path)?;
    let core = VmiCore::new(driver)?;

    let registers = core.registers(VcpuId(0))?;
    let kernel_info =
        WindowsOs::find_kernel(&core, &registers)?.ok_or(UnpackError::ConnectionLost(
            "could not locate Windows kernel in crash dump".into(),
        ))?;
    tracing::info!(?kernel_info, "located kernel image");

    let profile = load_profile(&config.profile_path)?;
    let os = WindowsOs::<VmiKdmpDriver<Amd64>>::new(&profile.raw)?;
    let session = VmiSession::new(&core, &os);

    let (kernel_root, list_head, target) = resolve_target(&core, &session, &profile, &config.process)?;

    // An offline dump never exits on its own; the shutdown flag still lets
    // an operator Ctrl-C out once the initial snapshot has been taken.
    let terminate_flag = install_shutdown_handler()?;
    let (queue, writer) = dump::spawn(config.output_dir.clone(), config.queue_capacity);

    session.handle(|session| {
        Engine::new(
            session,
            &config,
            &profile,
            kernel_root,
            list_head,
            target,
            queue,
            terminate_flag,
        )
    })?;

    writer.join().ok();

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.config()?;

    match &config.target {
        #[cfg(feature = "driver-xen")]
        Target::Domain(name) => run_xen(config.clone(), name)?,

        #[cfg(not(feature = "driver-xen"))]
        Target::Domain(_) => {
            return Err(Box::new(UnpackError::Config(
                "this binary was built without the driver-xen feature".into(),
            )));
        }

        #[cfg(feature = "driver-kdmp")]
        Target::DumpFile(path) => run_kdmp(config.clone(), path)?,

        #[cfg(not(feature = "driver-kdmp"))]
        Target::DumpFile(_) => {
            return Err(Box::new(UnpackError::Config(
                "this binary was built without the driver-kdmp feature".into(),
            )));
        }
    }

    Ok(())
}
