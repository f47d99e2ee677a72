//! plugvet: crash-isolating orchestrator for audio-plugin validation.
//!
//! A supervisor process hands batches of plugins to a short-lived worker
//! process over a framed duplex pipe; the worker runs the external test
//! battery and streams progress events back. A plugin that hangs, faults,
//! or aborts kills only the worker: the supervisor observes a clean
//! connection loss and relaunches on the next request.

mod descriptor;
mod log_flush;
mod signal_guard;
mod validator;
mod version;

pub mod bridge;
pub mod orchestrator;
pub mod supervisor;
pub mod worker;

pub use descriptor::{DescriptorError, PluginDescriptor};
pub use orchestrator::{
    LaunchError, SelfSpawner, SpawnError, WorkerConnection, WorkerSpawner,
};
pub use signal_guard::{install_fatal_signal_guard, install_panic_abort_hook};
pub use supervisor::{Supervisor, SupervisorConfig, ValidationListener};
pub use validator::{CaseResult, PluginSource, Validator, num_failures};
pub use version::{PRODUCT_NAME, VERSION, banner};
pub use worker::{
    WORKER_MODE_TOKEN, WorkerConfig, init_worker_logging, run_worker, run_worker_process,
    worker_mode,
};
