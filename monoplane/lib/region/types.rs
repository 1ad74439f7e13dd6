use typed_builder::TypedBuilder;

use crate::{
    models::{EndpointKind, RegionScope},
    utils::Secret,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A region creation request.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewRegion {
    /// Explicit id. A random one is generated when absent.
    #[builder(default, setter(strip_option, into))]
    pub id: Option<String>,

    /// The region name.
    #[builder(setter(into))]
    pub name: String,

    /// Who may use the region.
    #[builder(default = RegionScope::Shared)]
    pub scope: RegionScope,

    /// Whether quota enforcement applies.
    #[builder(default = true)]
    pub enforce_quotas: bool,
}

/// New URLs for the endpoints of a region. `None` leaves an endpoint untouched.
#[derive(Debug, Default, Clone, TypedBuilder)]
pub struct EndpointUpdate {
    /// The ingress proxy URL.
    #[builder(default, setter(strip_option, into))]
    pub proxy_url: Option<String>,

    /// The SSH gateway URL.
    #[builder(default, setter(strip_option, into))]
    pub ssh_gateway_url: Option<String>,

    /// The snapshot manager URL.
    #[builder(default, setter(strip_option, into))]
    pub snapshot_manager_url: Option<String>,
}

/// The plaintext of a freshly rotated credential. Only returned once.
#[derive(Debug, Clone)]
pub struct RotatedCredential {
    /// The endpoint that was rotated.
    pub endpoint: EndpointKind,

    /// The endpoint URL the credential is valid against.
    pub url: String,

    /// The new credential version.
    pub version: i64,

    /// The new secret.
    pub secret: Secret,
}

/// A point-in-time read of an endpoint's URL and credential version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCredential {
    /// The endpoint URL.
    pub url: String,

    /// The credential version.
    pub version: i64,
}

/// Events broadcast by the region registry.
#[derive(Debug, Clone)]
pub enum RegionEvent {
    /// An endpoint credential was replaced. The previous version is no longer accepted.
    CredentialsRotated {
        /// The region.
        region_id: String,

        /// The endpoint.
        endpoint: EndpointKind,

        /// The new credential version.
        version: i64,

        /// The endpoint URL.
        url: String,

        /// The new secret, for deployment tooling.
        secret: Secret,
    },

    /// A region was deleted.
    Deleted {
        /// The region.
        region_id: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EndpointUpdate {
    /// The requested URLs paired with their endpoint kinds.
    pub fn entries(&self) -> impl Iterator<Item = (EndpointKind, &str)> {
        [
            (EndpointKind::Proxy, self.proxy_url.as_deref()),
            (EndpointKind::SshGateway, self.ssh_gateway_url.as_deref()),
            (
                EndpointKind::SnapshotManager,
                self.snapshot_manager_url.as_deref(),
            ),
        ]
        .into_iter()
        .filter_map(|(kind, url)| url.map(|url| (kind, url)))
    }
}
