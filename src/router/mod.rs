mod select;
mod selector;
mod target;

pub use select::{select, Hint};
pub use selector::{FirstSelector, InstanceSelector, RoundRobinSelector, TargetResolver};
pub use target::RouteTarget;

use serde::Deserialize;

/// Where statements that touch SQL variables may execute.
///
/// With `All`, user-variable writes are broadcast so replicas stay usable
/// for variable reads; with `Primary`, everything involving variables is
/// pinned to the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseSqlVariablesIn {
    #[default]
    All,
    Primary,
}
