//! Event fan-out
//!
//! Listeners are `{event, func}` pairs declared in plugin manifests. An
//! event dispatch invokes each listener's export on its owning plugin with
//! the event data as payload, in listener registration order, instantiating
//! owners lazily. A listener failure is logged and the fan-out continues.

use crate::engine::EngineShared;
use std::sync::Arc;
use trellis_plugin_api::Event;

/// Dispatch `event` to every matching listener; returns how many listeners
/// completed successfully.
///
/// A non-empty `event.target` narrows delivery to listeners owned by the
/// plugin with that id.
pub(crate) fn dispatch(shared: &Arc<EngineShared>, event: &Event) -> usize {
    let bindings = {
        let registry = crate::lock(&shared.registry);
        registry.listeners_for(&event.id)
    };

    let mut delivered = 0;
    for binding in bindings {
        if !event.target.is_empty() && binding.plugin.id != event.target {
            continue;
        }
        match EngineShared::call_plugin_func(shared, &binding.plugin, &binding.func, &event.data) {
            Ok(_) => delivered += 1,
            Err(error) => {
                tracing::warn!(
                    category = "event",
                    event = %event.id,
                    plugin = %binding.plugin,
                    func = %binding.func,
                    error = %error,
                    "Listener dispatch failed"
                );
            }
        }
    }

    tracing::debug!(
        category = "event",
        event = %event.id,
        source = %event.source,
        delivered,
        "Event dispatched"
    );
    delivered
}
