use typed_builder::TypedBuilder;

use crate::models::{Resources, RunnerApiVersion};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A runner registration request.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewRunner {
    /// The runner id. Generated when not given.
    #[builder(default, setter(strip_option, into))]
    pub id: Option<String>,

    /// The region the runner joins.
    #[builder(setter(into))]
    pub region_id: String,

    /// The base URL of the runner's API.
    #[builder(setter(into))]
    pub api_url: String,

    /// The bearer credential for the runner's API.
    #[builder(setter(into))]
    pub api_key: String,

    /// The protocol generation the runner speaks.
    #[builder(default = RunnerApiVersion::V0)]
    pub api_version: RunnerApiVersion,

    /// Advertised capacity.
    pub capacity: Resources,
}

/// Runner state changes observed by the fleet manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// The runner passed a health check and is eligible for placement.
    RunnerReady {
        /// The runner.
        runner_id: String,

        /// Its region.
        region_id: String,
    },

    /// The runner failed enough health checks in a row to be taken out of placement.
    RunnerUnresponsive {
        /// The runner.
        runner_id: String,

        /// Its region.
        region_id: String,
    },

    /// The runner stayed unresponsive too long, or an operator disabled it.
    RunnerDisabled {
        /// The runner.
        runner_id: String,

        /// Its region.
        region_id: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetEvent {
    /// The runner the event is about.
    pub fn runner_id(&self) -> &str {
        match self {
            FleetEvent::RunnerReady { runner_id, .. }
            | FleetEvent::RunnerUnresponsive { runner_id, .. }
            | FleetEvent::RunnerDisabled { runner_id, .. } => runner_id,
        }
    }
}
