//! Shutdown signal bridge.
//!
//! Uses `sigaction` (not `signal`) so handlers are not reset after the first
//! delivery. The handlers only perform a single atomic store, which is safe
//! at any interruption point.
//!
//! - SIGINT: raise the process-wide abort flag
//! - SIGUSR1: diagnostic no-op (counts deliveries, never touches loop state)
//! - SIGKILL/SIGSTOP: cannot be caught, left alone
//! - everything else: ignored

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, warn};

/// Process-wide abort flag, written from the SIGINT handler.
static PROCESS_ABORT: AtomicBool = AtomicBool::new(false);

/// Number of SIGUSR1 deliveries observed.
static DIAGNOSTIC_SIGNALS: AtomicUsize = AtomicUsize::new(0);

/// Cooperative stop request observed by the server loop at the top of every
/// iteration.
///
/// [`AbortFlag::process`] is the instance toggled by SIGINT. Instances from
/// [`AbortFlag::new`] are independent and let an embedder stop one loop
/// without signals.
#[derive(Debug, Clone)]
pub struct AbortFlag(Cell);

#[derive(Debug, Clone)]
enum Cell {
    Process,
    Local(Arc<AtomicBool>),
}

impl AbortFlag {
    /// The flag set by the SIGINT handler.
    pub fn process() -> Self {
        Self(Cell::Process)
    }

    /// A fresh flag not connected to any signal.
    pub fn new() -> Self {
        Self(Cell::Local(Arc::new(AtomicBool::new(false))))
    }

    fn cell(&self) -> &AtomicBool {
        match &self.0 {
            Cell::Process => &PROCESS_ABORT,
            Cell::Local(flag) => flag,
        }
    }

    pub fn is_raised(&self) -> bool {
        self.cell().load(Ordering::Acquire)
    }

    pub fn raise(&self) {
        self.cell().store(true, Ordering::Release);
    }
}

impl Default for AbortFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// How many SIGUSR1 signals were delivered since process start.
pub fn diagnostic_signal_count() -> usize {
    DIAGNOSTIC_SIGNALS.load(Ordering::Relaxed)
}

extern "C" fn on_interrupt(_sig: libc::c_int) {
    PROCESS_ABORT.store(true, Ordering::Release);
}

extern "C" fn on_diagnostic(_sig: libc::c_int) {
    DIAGNOSTIC_SIGNALS.fetch_add(1, Ordering::Relaxed);
}

/// Outcome of [`install_signal_handlers`].
#[derive(Debug, Default)]
pub struct SignalInstall {
    /// Dispositions applied successfully.
    pub installed: usize,
    /// Signals left at their previous disposition.
    pub failed: Vec<Signal>,
}

impl SignalInstall {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn disposition(sig: Signal) -> Option<SigHandler> {
    match sig {
        Signal::SIGKILL | Signal::SIGSTOP => None,
        Signal::SIGINT => Some(SigHandler::Handler(on_interrupt)),
        Signal::SIGUSR1 => Some(SigHandler::Handler(on_diagnostic)),
        _ => Some(SigHandler::SigIgn),
    }
}

/// Install the process signal dispositions.
///
/// A signal whose disposition cannot be changed is logged and keeps its
/// default behavior; installation never fails as a whole.
pub fn install_signal_handlers() -> SignalInstall {
    let mut report = SignalInstall::default();

    for sig in Signal::iterator() {
        let Some(handler) = disposition(sig) else {
            continue;
        };
        let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
        // SAFETY: the handlers only perform atomic stores, which are
        // async-signal-safe.
        match unsafe { sigaction(sig, &action) } {
            Ok(_) => report.installed += 1,
            Err(errno) => {
                warn!(signal = %sig, error = %errno, "cannot assign signal handler");
                report.failed.push(sig);
            }
        }
    }

    debug!(
        installed = report.installed,
        failed = report.failed.len(),
        "signal handlers installed"
    );
    report
}
