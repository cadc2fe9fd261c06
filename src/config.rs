//! Tunables for a [`BleCentral`](crate::BleCentral) instance.

use crate::scan::ReemitTrigger;

/// Configuration for the central stack.
///
/// The defaults match the original system's behavior; most callers never
/// need to change them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CentralConfig {
    /// Capacity of the discovered-device broadcast channel.
    pub scan_channel_capacity: usize,
    /// Capacity of each per-characteristic notification channel.
    pub notification_channel_capacity: usize,
    /// Which descriptor change re-emits an already-seen device when the
    /// scan filter suppresses duplicates.
    pub reemit_trigger: ReemitTrigger,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            scan_channel_capacity: 100,
            notification_channel_capacity: 256,
            reemit_trigger: ReemitTrigger::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CentralConfig::default();
        assert_eq!(config.scan_channel_capacity, 100);
        assert_eq!(config.notification_channel_capacity, 256);
        assert_eq!(config.reemit_trigger, ReemitTrigger::AnyFieldChange);
    }
}
