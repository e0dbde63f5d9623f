//! Device plugin metrics.
//!
//! Names follow Prometheus conventions (`_total` suffix for counters). The
//! helpers are no-ops until an exporter is installed.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register all plugin metrics with descriptions.
pub fn register_plugin_metrics() {
    // Discovery
    describe_gauge!("sandbox_discovered_units", "Isolation units found by the last discovery pass");

    // Plugin lifecycle
    describe_gauge!("sandbox_plugin_devices", "Devices advertised by a plugin instance (by class)");
    describe_counter!(
        "sandbox_plugin_restarts_total",
        "Plugin restarts triggered by socket removal (by class)"
    );
    describe_counter!(
        "sandbox_health_transitions_total",
        "Device health transitions (by class, health)"
    );

    // Allocation
    describe_counter!("sandbox_allocations_total", "Allocate requests (by class, result)");

    // CDI
    describe_counter!("sandbox_cdi_specs_written_total", "CDI spec files written");
}

pub fn set_discovered_units(count: usize) {
    gauge!("sandbox_discovered_units").set(count as f64);
}

pub fn set_plugin_devices(class: &str, count: usize) {
    gauge!("sandbox_plugin_devices", "class" => class.to_string()).set(count as f64);
}

pub fn record_plugin_restart(class: &str) {
    counter!("sandbox_plugin_restarts_total", "class" => class.to_string()).increment(1);
}

pub fn record_health_transition(class: &str, health: &str) {
    counter!(
        "sandbox_health_transitions_total",
        "class" => class.to_string(),
        "health" => health.to_string()
    )
    .increment(1);
}

pub fn record_allocation(class: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("sandbox_allocations_total", "class" => class.to_string(), "result" => result)
        .increment(1);
}

pub fn record_cdi_spec_written() {
    counter!("sandbox_cdi_specs_written_total").increment(1);
}
