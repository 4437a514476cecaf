//! Visible-set union and the frozen display order.

use std::collections::BTreeSet;

use {mcpdock_common::PluginId, tracing::debug};

/// Every id any source knows about.
///
/// A plugin may be declared but not installed, installed but not declared,
/// or remote and never installed, so no single source is authoritative.
pub fn visible_ids(
    configured: &BTreeSet<PluginId>,
    remote: &BTreeSet<PluginId>,
    discovered: &BTreeSet<PluginId>,
) -> BTreeSet<PluginId> {
    configured
        .iter()
        .chain(remote)
        .chain(discovered)
        .cloned()
        .collect()
}

/// Primary sort key of a row. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Readiness {
    /// Enabled and its capabilities are loaded.
    Ready = 0,
    Enabled = 1,
    Other = 2,
}

impl Readiness {
    pub fn of(enabled: bool, capabilities_loaded: bool) -> Self {
        match (enabled, capabilities_loaded) {
            (true, true) => Self::Ready,
            (true, false) => Self::Enabled,
            (false, _) => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub id: PluginId,
    pub display_name: String,
    pub readiness: Readiness,
}

/// Readiness, then case-insensitive display name, then id.
pub fn display_order(keys: &[OrderKey]) -> Vec<PluginId> {
    let mut sorted: Vec<_> = keys
        .iter()
        .map(|k| (k.readiness, k.display_name.to_lowercase(), &k.id))
        .collect();
    sorted.sort();
    sorted.into_iter().map(|(_, _, id)| id.clone()).collect()
}

#[derive(Debug, Clone)]
struct Frozen {
    visible: BTreeSet<PluginId>,
    order: Vec<PluginId>,
}

/// Display order that stops re-sorting once capability discovery settled.
///
/// While frozen, status changes only patch row content. The freeze ends on
/// [`OrderCache::invalidate`] or when the visible set changes.
#[derive(Debug, Default)]
pub struct OrderCache {
    frozen: Option<Frozen>,
}

impl OrderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order for `keys`. With `settled` the computed order is frozen for the
    /// current visible set.
    pub fn order(&mut self, keys: &[OrderKey], settled: bool) -> Vec<PluginId> {
        let visible: BTreeSet<_> = keys.iter().map(|k| k.id.clone()).collect();
        if let Some(frozen) = &self.frozen {
            if frozen.visible == visible {
                return frozen.order.clone();
            }
            debug!("visible set changed, dropping frozen order");
            self.frozen = None;
        }

        let order = display_order(keys);
        if settled {
            self.frozen = Some(Frozen {
                visible,
                order: order.clone(),
            });
        }
        order
    }

    pub fn invalidate(&mut self) {
        self.frozen = None;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }
}
