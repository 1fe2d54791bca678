//! Plugin loader collaborator
//!
//! The plugin loader itself lives outside this crate; it announces handler
//! availability through [`PluginEvent`]s, which the runtime applies to the
//! exelet store and then pushes into every live connection's dispatch
//! table.

use crate::exelet::Exelet;

/// Handler-availability events emitted by the plugin loader.
#[derive(Clone)]
pub enum PluginEvent {
    /// A plugin loaded: register its exelets under its namespace
    Loaded {
        namespace: String,
        exelets: Vec<Exelet>,
    },
    /// A plugin unloaded: revoke everything under its namespace
    Unloaded { namespace: String },
}
