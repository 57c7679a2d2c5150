//! Control Plane Module
//!
//! The provisioning surface for multishare volumes and the cloud backends
//! it drives.

pub mod admission;
pub mod backends;
pub mod volume_id;

pub use admission::*;
pub use backends::*;
pub use volume_id::VolumeId;
