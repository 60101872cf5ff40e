use kube::{
    Api,
    api::{Patch, PatchParams, Resource},
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use super::MANAGER_NAME;
use super::Error;

/// Computes a JSON-patch between `before` and `after` and applies it via
/// server-side apply under this controller's field manager.
///
/// `before` is the object as last observed; `after` is a clone of it with the
/// desired mutation already applied in-memory. Only the fields that actually
/// changed are sent, so unrelated fields set by other actors are preserved.
pub async fn apply_diff<T>(api: &Api<T>, name: &str, before: &T, after: &T) -> Result<T, Error>
where
    T: Clone + Resource + Serialize + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
{
    let diff = json_patch::diff(
        &serde_json::to_value(before)?,
        &serde_json::to_value(after)?,
    );
    let patch = Patch::Json::<T>(diff);
    api.patch(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
        .map_err(Error::from_kube)
}
