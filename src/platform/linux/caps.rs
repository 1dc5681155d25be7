use std::str::FromStr;

use anyhow::{Context, Result};
use caps::{CapSet, Capability, CapsHashSet};

use crate::core::error::RuntimeError;
use crate::util::log::diag;

/// The capability whitelist: everything listed survives in the bounding
/// and traditional sets, everything else is dropped.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    allowed: CapsHashSet,
}

impl CapabilitySet {
    /// Translate the configured names. Names must carry the `CAP_`
    /// prefix and resolve to a capability this kernel interface knows;
    /// anything else is a configuration error, raised before the
    /// container child exists.
    pub fn from_names(names: &[String]) -> Result<CapabilitySet, RuntimeError> {
        let mut allowed = CapsHashSet::new();
        for name in names {
            if name.len() < 4 || !name.starts_with("CAP_") {
                return Err(RuntimeError::UnknownCapability(name.clone()));
            }
            let cap = Capability::from_str(name)
                .map_err(|_| RuntimeError::UnknownCapability(name.clone()))?;
            allowed.insert(cap);
        }
        Ok(CapabilitySet { allowed })
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Restrict the process to the whitelist. Runs in the child after
    /// setuid, so the new identity cannot re-grant anything.
    ///
    /// Ordering keeps every transition legal: bounding drops need
    /// CAP_SETPCAP still effective, inheritable additions need the
    /// permitted set still wide, and permitted shrinks last so the
    /// effective set it must cover is already in place.
    pub fn apply(&self) -> Result<()> {
        diag!("restrict capabilities to {:?}", self.allowed);
        for cap in caps::all() {
            if !self.allowed.contains(&cap) {
                caps::drop(None, CapSet::Bounding, cap)
                    .with_context(|| format!("failed to drop {cap} from the bounding set"))?;
            }
        }
        caps::set(None, CapSet::Inheritable, &self.allowed)
            .context("failed to set inheritable capabilities")?;
        caps::set(None, CapSet::Effective, &self.allowed)
            .context("failed to set effective capabilities")?;
        caps::set(None, CapSet::Permitted, &self.allowed)
            .context("failed to set permitted capabilities")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() {
        let set = CapabilitySet::from_names(&[
            "CAP_CHOWN".to_string(),
            "CAP_NET_BIND_SERVICE".to_string(),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn an_empty_list_is_a_valid_whitelist() {
        let set = CapabilitySet::from_names(&[]).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn names_shorter_than_four_bytes_are_rejected() {
        let err = CapabilitySet::from_names(&["CAP".to_string()]).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownCapability(name) if name == "CAP"));
    }

    #[test]
    fn the_prefix_is_required() {
        assert!(CapabilitySet::from_names(&["NET_BIND_SERVICE".to_string()]).is_err());
        assert!(CapabilitySet::from_names(&["XXX_CHOWN".to_string()]).is_err());
    }

    #[test]
    fn unknown_suffixes_are_rejected() {
        let err = CapabilitySet::from_names(&["CAP_DOES_NOT_EXIST".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::UnknownCapability(name) if name == "CAP_DOES_NOT_EXIST"
        ));
    }

    #[test]
    fn duplicates_collapse() {
        let set =
            CapabilitySet::from_names(&["CAP_CHOWN".to_string(), "CAP_CHOWN".to_string()])
                .unwrap();
        assert_eq!(set.len(), 1);
    }
}
