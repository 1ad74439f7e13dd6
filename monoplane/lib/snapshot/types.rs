use typed_builder::TypedBuilder;

use crate::{fleet::RegistryAuth, models::Resources};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A snapshot registration request.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewSnapshot {
    /// The owning tenant. `None` registers a platform-wide snapshot.
    #[builder(default, setter(strip_option, into))]
    pub tenant_id: Option<String>,

    /// The name, unique per tenant.
    #[builder(setter(into))]
    pub name: String,

    /// The source image reference.
    #[builder(setter(into))]
    pub image_name: String,

    /// A Dockerfile body. Set for snapshots that are built rather than pulled.
    #[builder(default, setter(strip_option, into))]
    pub build_context: Option<String>,

    /// Resources of sandboxes created from the snapshot. Defaults to the configured footprint.
    #[builder(default, setter(strip_option))]
    pub footprint: Option<Resources>,

    /// Hidden from end users.
    #[builder(default)]
    pub hidden: bool,
}

/// Where a snapshot can be pulled from inside one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionImage {
    /// The full image reference.
    pub image: String,

    /// Pull credentials.
    pub registry: RegistryAuth,
}
