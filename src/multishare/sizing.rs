//! Sizing Engine
//!
//! Capacity math for multishare instances and shares. All arithmetic is
//! integer; steps are applied with ceiling division.

use crate::config::MultishareConfig;
use crate::crd::{InstanceInfo, ShareInfo};
use crate::domain::model::GIB;
use crate::domain::ports::CapacityRange;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::warn;

/// Round `bytes` up to the next multiple of `step`
pub fn align_bytes(bytes: u64, step: u64) -> u64 {
    if step == 0 {
        return bytes;
    }
    bytes.div_ceil(step).saturating_mul(step)
}

/// Resize granularity of an instance in bytes
pub fn instance_step_bytes(instance: &InstanceInfo, config: &MultishareConfig) -> u64 {
    let step_gb = instance
        .status
        .as_ref()
        .map(|s| s.capacity_step_size_gb)
        .unwrap_or(0);
    if step_gb == 0 {
        config.default_step_bytes
    } else {
        step_gb * GIB
    }
}

/// Smallest valid instance capacity holding `used_bytes`
pub fn target_instance_capacity(used_bytes: u64, step: u64, config: &MultishareConfig) -> u64 {
    align_bytes(used_bytes, step).clamp(config.min_instance_bytes, config.max_instance_bytes)
}

/// Recompute the capacity an instance needs for the shares assigned to it.
///
/// Returns `None` when the result equals the current spec capacity.
pub fn resize_instance(
    instance: &InstanceInfo,
    shares: &BTreeMap<String, ShareInfo>,
    config: &MultishareConfig,
) -> Option<u64> {
    let mut used: u64 = 0;
    for name in instance.share_names() {
        match shares.get(name) {
            Some(share) => used = used.saturating_add(share.spec.capacity_bytes),
            None => warn!(
                "Instance {} lists share {} which has no record, skipping in sizing",
                instance.name(),
                name
            ),
        }
    }

    let target = target_instance_capacity(used, instance_step_bytes(instance, config), config);
    if target == instance.spec.capacity_bytes {
        None
    } else {
        Some(target)
    }
}

/// Pre-flight check before placing `extra_bytes` on an instance that already
/// serves `used_bytes`.
///
/// Returns the capacity the instance must grow to, or `None` if the free
/// space already suffices. The result is not aligned or clamped.
pub fn instance_needs_expand(capacity_bytes: u64, used_bytes: u64, extra_bytes: u64) -> Option<u64> {
    let free = capacity_bytes.saturating_sub(used_bytes);
    if free >= extra_bytes {
        return None;
    }
    Some(capacity_bytes + (extra_bytes - free))
}

/// Validate a requested capacity range and produce the share size to provision
pub fn share_request_capacity(
    range: Option<&CapacityRange>,
    config: &MultishareConfig,
) -> Result<u64> {
    let range = match range {
        Some(r) if r.required_bytes > 0 || r.limit_bytes > 0 => r,
        _ => return Ok(config.min_share_bytes),
    };

    let (required, limit) = (range.required_bytes, range.limit_bytes);
    if limit > 0 && required > limit {
        return Err(Error::OutOfRange(format!(
            "required bytes {} exceed limit bytes {}",
            required, limit
        )));
    }
    if limit > 0 && limit < config.min_share_bytes {
        return Err(Error::OutOfRange(format!(
            "limit bytes {} are below the minimum share size {}",
            limit, config.min_share_bytes
        )));
    }

    let capacity = align_bytes(required.max(config.min_share_bytes), GIB);
    if capacity > config.max_share_bytes {
        return Err(Error::OutOfRange(format!(
            "requested {} bytes exceed the maximum share size {}",
            capacity, config.max_share_bytes
        )));
    }
    if limit > 0 && capacity > limit {
        return Err(Error::OutOfRange(format!(
            "aligned capacity {} exceeds limit bytes {}",
            capacity, limit
        )));
    }
    Ok(capacity)
}
