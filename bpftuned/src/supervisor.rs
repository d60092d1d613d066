//! The daemon event loop.
//!
//! Single-threaded and cooperative: one loop polls the event ring, runs
//! handlers inline, rescans the plugin directory on a timer and reacts to
//! termination signals. Handlers are bounded (sysctl access, correlation
//! updates, logging), so the loop never parks for long outside the poll
//! timer.
//!
//! Shutdown stops taking new events, drains what the ring already holds
//! for at most half a second, then finalizes every live tuner in reverse
//! load order.

use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::interval;

use bpftune_core::config::Config;
use bpftune_core::host::{DispatchOutcome, TunerHost};
use bpftune_core::ring::{RingConsumer, RingHealth};

/// How long shutdown keeps draining already-emitted events.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Why the loop ended; maps straight to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Signal-driven shutdown.
    Clean,
    /// Repeated hard ring failures.
    RingUnhealthy,
    /// A tuner crashed inside its event handler.
    PluginFatal,
}

impl ExitReason {
    pub fn code(self) -> u8 {
        match self {
            ExitReason::Clean => 0,
            ExitReason::RingUnhealthy => 2,
            ExitReason::PluginFatal => 3,
        }
    }
}

/// The supervisor owning the host, the ring consumer and the timers.
pub struct Supervisor {
    config: Config,
    host: TunerHost,
    consumer: Option<RingConsumer>,
    health: RingHealth,
    ring_waiting_logged: bool,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let host = TunerHost::new(&config);
        Supervisor {
            config,
            host,
            consumer: None,
            health: RingHealth::default(),
            ring_waiting_logged: false,
        }
    }

    /// The tuner host, for built-in registration and tests.
    pub fn host_mut(&mut self) -> &mut TunerHost {
        &mut self.host
    }

    pub fn host(&self) -> &TunerHost {
        &self.host
    }

    /// Attach to the ring if it exists yet. The kernel side creates it, so
    /// a missing ring at startup just means the probes are not up.
    fn ensure_ring(&mut self) -> bool {
        if self.consumer.is_some() {
            return true;
        }
        match RingConsumer::open(&self.config.ring_path) {
            Ok(consumer) => {
                info!("event ring attached at {:?}", self.config.ring_path);
                self.ring_waiting_logged = false;
                self.consumer = Some(consumer);
                true
            }
            Err(e) => {
                if !self.ring_waiting_logged {
                    info!("waiting for event ring: {}", e);
                    self.ring_waiting_logged = true;
                }
                false
            }
        }
    }

    /// One poll tick: drain up to the budget and dispatch inline.
    /// Returns the exit reason when something fatal happened.
    pub fn poll_once(&mut self) -> Option<ExitReason> {
        if !self.ensure_ring() {
            return None;
        }
        let drained = {
            let consumer = self.consumer.as_mut().expect("ring attached above");
            consumer.drain(self.config.drain_budget)
        };
        match drained {
            Ok(events) => {
                for event in &events {
                    if self.host.dispatch(event) == DispatchOutcome::PluginPanicked {
                        return Some(ExitReason::PluginFatal);
                    }
                }
                None
            }
            Err(e) => {
                warn!("{}", e);
                if self.health.record_failure(Instant::now()) {
                    error!("event ring is unhealthy, shutting down");
                    return Some(ExitReason::RingUnhealthy);
                }
                None
            }
        }
    }

    /// One rescan tick: reconcile the plugin roster and age namespaces.
    pub fn rescan_once(&mut self) {
        self.host.rescan(&self.config.plugin_dir);
        self.host.sweep_namespaces();
    }

    /// Run until a signal or a fatal condition.
    pub async fn run(&mut self) -> ExitReason {
        info!(
            "supervising tuners from {:?}, ring {:?}",
            self.config.plugin_dir, self.config.ring_path
        );

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                // Without signal delivery the daemon could never shut down
                // cleanly; give up before touching any tunable.
                error!("cannot install SIGTERM handler: {}", e);
                return ExitReason::Clean;
            }
        };
        let mut poll = interval(self.config.poll_interval);
        let mut rescan = interval(self.config.rescan);

        let reason = loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Some(reason) = self.poll_once() {
                        break reason;
                    }
                }
                _ = rescan.tick() => self.rescan_once(),
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break ExitReason::Clean;
                }
                _ = sigterm.recv() => {
                    info!("termination signal received");
                    break ExitReason::Clean;
                }
            }
        };

        self.shutdown();
        reason
    }

    /// Drain briefly, then finalize every live tuner.
    fn shutdown(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while Instant::now() < deadline {
            match self.consumer.as_ref() {
                Some(consumer) if !consumer.is_empty() => {
                    if self.poll_once().is_some() {
                        break;
                    }
                }
                _ => break,
            }
        }
        self.host.shutdown();
        info!("shutdown complete");
    }
}
