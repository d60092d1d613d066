//! TCP send/receive buffer tuner.
//!
//! Kernel probes watch sockets exhausting their buffer limits and emit
//! events proposing grown (or, under memory pressure, shrunk) values for
//! `net.ipv4.tcp_wmem` / `net.ipv4.tcp_rmem`. This tuner mediates those
//! proposals:
//!
//! - increase events carrying a latency sample feed the correlation entry
//!   for the (tunable, namespace) pair with (proposed max, latency)
//! - before committing an increase it consults that entry; when buffer
//!   growth has been observed to move latency with it, the increase is
//!   downgraded to a no-change scenario and the previous max is kept
//! - all writes go through the host, which caps them against the captured
//!   original and enforces the per-namespace cooldown

use log::{debug, info, warn};

use bpftune_core::compat::SK_MEM_QUANTUM;
use bpftune_core::error::CoreError;
use bpftune_core::tuner::{
    ScenarioDirection, ScenarioSpec, TunableKind, TunableSpec, TunerContext, TunerPlugin,
};
use bpftune_events::TuneEvent;

/// Tunable ids, equal to the `event_id` the probes stamp.
pub const TCP_WMEM: u32 = 0;
pub const TCP_RMEM: u32 = 1;

/// Scenario ids shared with the kernel probes.
pub const TCP_BUFFER_INCREASE: u32 = 1;
pub const TCP_BUFFER_DECREASE: u32 = 2;
pub const TCP_BUFFER_NOCHANGE_LATENCY: u32 = 3;

fn tunable_name(id: u32) -> &'static str {
    match id {
        TCP_WMEM => "net.ipv4.tcp_wmem",
        TCP_RMEM => "net.ipv4.tcp_rmem",
        _ => "unknown",
    }
}

/// The worked-example tuner for TCP buffer sizing.
pub struct TcpBufferTuner {
    corr_threshold: f64,
}

impl TcpBufferTuner {
    pub fn new(corr_threshold: f64) -> Self {
        TcpBufferTuner { corr_threshold }
    }
}

impl TunerPlugin for TcpBufferTuner {
    fn name(&self) -> &str {
        "tcp_buffer"
    }

    fn init(&mut self, ctx: &mut TunerContext) -> Result<(), CoreError> {
        for id in [TCP_WMEM, TCP_RMEM] {
            ctx.register_tunable(&TunableSpec {
                id,
                kind: TunableKind::Sysctl,
                name: tunable_name(id).to_string(),
                namespaced: true,
                arity: 3,
            })?;
        }
        ctx.register_scenario(&ScenarioSpec {
            id: TCP_BUFFER_INCREASE,
            label: "need to increase buffer size".to_string(),
            description: "sockets are limited by the current buffer maximum".to_string(),
            direction: ScenarioDirection::Increase,
        })?;
        ctx.register_scenario(&ScenarioSpec {
            id: TCP_BUFFER_DECREASE,
            label: "memory pressure, need to decrease buffer size".to_string(),
            description: "tcp memory exceeded its pressure threshold".to_string(),
            direction: ScenarioDirection::Decrease,
        })?;
        ctx.register_scenario(&ScenarioSpec {
            id: TCP_BUFFER_NOCHANGE_LATENCY,
            label: "buffer size unchanged, increase correlates with latency".to_string(),
            description: "growing the buffer was observed to grow latency too".to_string(),
            direction: ScenarioDirection::None,
        })?;
        Ok(())
    }

    fn event_handler(&mut self, ctx: &mut TunerContext, event: &TuneEvent) {
        let update = &event.updates[0];
        let cookie = event.netns_cookie;

        match event.scenario_id {
            TCP_BUFFER_INCREASE => {
                // Probes report the observed latency alongside the proposed
                // growth; every sample sharpens the estimator before it is
                // consulted.
                if let Some(latency) = event.latency_sample() {
                    ctx.update_correlation(update.id, cookie, update.new[2], latency);
                }
                let corr = ctx.corr_coefficient(update.id, cookie);
                if corr > self.corr_threshold {
                    let covar = ctx.corr_covariance(update.id, cookie);
                    warn!(
                        "covar for '{}' netns {} (new {} {} {}): {} ; corr {}",
                        tunable_name(update.id),
                        cookie,
                        update.new[0],
                        update.new[1],
                        update.new[2],
                        covar,
                        corr
                    );
                    // Latency rises with this buffer; keep the old max.
                    let mut held = update.new;
                    held[2] = update.old[2];
                    if let Err(e) = ctx.request_write(
                        update.id,
                        TCP_BUFFER_NOCHANGE_LATENCY,
                        cookie,
                        &held,
                        "holding buffer max, growth correlates with latency",
                    ) {
                        debug!("held write rejected: {}", e);
                    }
                } else {
                    let mut proposed = update.new;
                    // The kernel accounts socket memory in quantum units;
                    // a smaller minimum buys nothing.
                    proposed[0] = proposed[0].max(SK_MEM_QUANTUM);
                    if let Err(e) = ctx.request_write(
                        update.id,
                        TCP_BUFFER_INCREASE,
                        cookie,
                        &proposed,
                        "sockets exhausted the current buffer maximum",
                    ) {
                        debug!("increase rejected: {}", e);
                    }
                }
            }
            TCP_BUFFER_DECREASE => {
                if let Err(e) = ctx.request_write(
                    update.id,
                    TCP_BUFFER_DECREASE,
                    cookie,
                    &update.new,
                    "tcp memory pressure",
                ) {
                    debug!("decrease rejected: {}", e);
                }
            }
            TCP_BUFFER_NOCHANGE_LATENCY => {
                info!(
                    "leaving '{}' unchanged in netns {}",
                    tunable_name(update.id),
                    cookie
                );
            }
            other => debug!("ignoring scenario {} for tuner tcp_buffer", other),
        }
    }

    fn fini(&mut self, _ctx: &mut TunerContext) {
        // Nothing beyond the host's rollback of everything we wrote.
    }
}
