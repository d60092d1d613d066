//! Minimum-viable tuner artifact.
//!
//! Registers a single scenario, no tunables, and logs every event it
//! receives. Drop the built `sample_tuner.so` into the daemon's plugin
//! directory to check the plumbing end to end: discovery, init, event
//! delivery and fini. Since nothing is ever written, fini restores
//! nothing.
//!
//! The three exported symbols below are the entire tuner contract.

use std::ffi::c_int;

use bpftune_core::tuner::{ScenarioDirection, ScenarioSpec, TunerContext};
use bpftune_events::TuneEvent;

const SCENARIO_SAMPLE: u32 = 1;

/// # Safety
/// Called by the tuner host with a context valid for the duration of the
/// call.
#[no_mangle]
pub unsafe extern "C" fn init(ctx: *mut TunerContext) -> c_int {
    let Some(ctx) = ctx.as_mut() else {
        return -1;
    };
    match ctx.register_scenario(&ScenarioSpec {
        id: SCENARIO_SAMPLE,
        label: "SAMPLE".to_string(),
        description: "a watched sysctl was accessed".to_string(),
        direction: ScenarioDirection::None,
    }) {
        Ok(()) => {
            ctx.log(log::Level::Debug, "init tuner sample");
            0
        }
        Err(_) => -1,
    }
}

/// # Safety
/// Called by the tuner host with pointers valid for the duration of the
/// call.
#[no_mangle]
pub unsafe extern "C" fn event_handler(ctx: *mut TunerContext, event: *const TuneEvent) {
    let (Some(ctx), Some(event)) = (ctx.as_mut(), event.as_ref()) else {
        return;
    };
    ctx.log(
        log::Level::Info,
        &format!("event (scenario {}) for tuner sample", event.scenario_id),
    );
}

/// # Safety
/// Called by the tuner host with a context valid for the duration of the
/// call.
#[no_mangle]
pub unsafe extern "C" fn fini(ctx: *mut TunerContext) {
    if let Some(ctx) = ctx.as_ref() {
        ctx.log(log::Level::Debug, "fini tuner sample, nothing to restore");
    }
}
