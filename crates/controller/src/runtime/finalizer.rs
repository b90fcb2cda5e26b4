//! # Finalizer
//!
//! Keeps a `PkiSecret` in the API server until its revoke/clear cleanup has run.

use crate::constants::{FIELD_MANAGER, FINALIZER};
use crate::crd::PkiSecret;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

pub fn has_finalizer(obj: &PkiSecret) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

/// Finalizer list with ours appended; `None` when it is already there
fn with_finalizer(existing: &[String]) -> Option<Vec<String>> {
    if existing.iter().any(|f| f == FINALIZER) {
        return None;
    }
    let mut finalizers = existing.to_vec();
    finalizers.push(FINALIZER.to_string());
    Some(finalizers)
}

/// Finalizer list without ours; `None` when it was not there
fn without_finalizer(existing: &[String]) -> Option<Vec<String>> {
    if !existing.iter().any(|f| f == FINALIZER) {
        return None;
    }
    Some(
        existing
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect(),
    )
}

/// Add the finalizer unless present. `api` must be scoped to the object's namespace.
///
/// # Errors
///
/// Returns the API error when the patch fails (including a resource version conflict).
pub async fn ensure_finalizer(api: &Api<PkiSecret>, obj: &PkiSecret) -> Result<(), kube::Error> {
    let Some(finalizers) = with_finalizer(obj.finalizers()) else {
        return Ok(());
    };
    patch_finalizers(api, obj, &finalizers).await?;
    debug!(resource = %obj.name_any(), "Added finalizer");
    Ok(())
}

/// Remove the finalizer from the named object, but only from the object with
/// `uid` when one is given so a recreated resource keeps its own finalizer.
///
/// Returns whether a patch was sent.
///
/// # Errors
///
/// Returns the API error when the read or the patch fails.
pub async fn remove_finalizer(
    api: &Api<PkiSecret>,
    name: &str,
    uid: Option<&str>,
) -> Result<bool, kube::Error> {
    let Some(obj) = api.get_opt(name).await? else {
        return Ok(false);
    };
    if uid.is_some() && obj.uid().as_deref() != uid {
        debug!(resource = %name, "Resource was recreated, keeping its finalizer");
        return Ok(false);
    }
    let Some(finalizers) = without_finalizer(obj.finalizers()) else {
        return Ok(false);
    };
    patch_finalizers(api, &obj, &finalizers).await?;
    debug!(resource = %name, "Removed finalizer");
    Ok(true)
}

async fn patch_finalizers(
    api: &Api<PkiSecret>,
    obj: &PkiSecret,
    finalizers: &[String],
) -> Result<(), kube::Error> {
    // resourceVersion makes the list replacement conditional on nobody else editing it
    let patch = json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    });
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_finalizer_appends_once() {
        let existing = vec!["other.io/keep".to_string()];
        let added = with_finalizer(&existing).unwrap();
        assert_eq!(added, vec!["other.io/keep".to_string(), FINALIZER.to_string()]);
        assert!(with_finalizer(&added).is_none());
    }

    #[test]
    fn test_without_finalizer_keeps_foreign_entries() {
        let existing = vec![FINALIZER.to_string(), "other.io/keep".to_string()];
        assert_eq!(
            without_finalizer(&existing).unwrap(),
            vec!["other.io/keep".to_string()]
        );
        assert!(without_finalizer(&["other.io/keep".to_string()]).is_none());
    }
}
