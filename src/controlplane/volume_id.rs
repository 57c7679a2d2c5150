//! Volume IDs
//!
//! `multishare/<pool-tag>/<project>/<location>/<instance>/<share>`

use crate::domain::model::{InstanceKey, ShareKey};
use crate::error::{Error, Result};

const PREFIX: &str = "multishare";

/// Decoded multishare volume ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeId {
    pub pool_tag: String,
    pub share: ShareKey,
}

impl VolumeId {
    pub fn new(pool_tag: impl Into<String>, share: ShareKey) -> Self {
        Self {
            pool_tag: pool_tag.into(),
            share,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            [PREFIX, pool, project, location, instance, share]
                if [pool, project, location, instance, share]
                    .iter()
                    .all(|p| !p.is_empty()) =>
            {
                Ok(Self::new(
                    *pool,
                    ShareKey::new(InstanceKey::new(*project, *location, *instance), *share),
                ))
            }
            _ => Err(Error::InvalidVolumeId(raw.to_string())),
        }
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let instance = &self.share.instance;
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            PREFIX, self.pool_tag, instance.project, instance.location, instance.name, self.share.share
        )
    }
}
