//! Kubernetes `Secret` destination store.

use super::{
    keys, ClearOutcome, DestinationError, DestinationRecord, DestinationStore, Provenance,
};
use crate::constants::{
    FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OWNER_API_VERSION_ANNOTATION,
    OWNER_KIND_ANNOTATION, OWNER_NAME_ANNOTATION,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Stores certificate material in Kubernetes Secrets.
///
/// Created Secrets carry an owner reference to the producing resource and the
/// `app.kubernetes.io/managed-by` label; every written Secret carries the
/// provenance annotations.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl std::fmt::Debug for KubeSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretStore").finish_non_exhaustive()
    }
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl DestinationStore for KubeSecretStore {
    async fn read(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DestinationRecord>, DestinationError> {
        let secret = self
            .api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, name, namespace))?;
        Ok(secret.as_ref().map(record_from_secret))
    }

    async fn write(
        &self,
        name: &str,
        namespace: &str,
        record: &DestinationRecord,
        create_if_missing: bool,
    ) -> Result<(), DestinationError> {
        let api = self.api(namespace);
        let existing = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, name, namespace))?;

        let Some(existing) = existing else {
            if !create_if_missing {
                return Err(DestinationError::not_found(name, namespace));
            }
            let secret = build_secret(name, namespace, record);
            api.create(&PostParams::default(), &secret)
                .await
                .map_err(|e| map_kube_error(e, name, namespace))?;
            info!(
                destination.name = name,
                destination.namespace = namespace,
                "Created destination Secret"
            );
            return Ok(());
        };

        if create_if_missing && !produced_by(&existing, record.provenance.as_ref()) {
            return Err(DestinationError::exists(name, namespace));
        }

        let patch = json!({
            "metadata": {
                "labels": record.labels,
                "annotations": annotations_for(record),
            },
            "stringData": record.to_data(),
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| map_kube_error(e, name, namespace))?;

        debug!(
            destination.name = name,
            destination.namespace = namespace,
            "Updated destination Secret"
        );
        Ok(())
    }

    async fn clear(
        &self,
        name: &str,
        namespace: &str,
        owner: Option<&Provenance>,
    ) -> Result<ClearOutcome, DestinationError> {
        let api = self.api(namespace);
        let existing = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, name, namespace))?
            .ok_or_else(|| DestinationError::not_found(name, namespace))?;

        let owned = is_managed(&existing) && owner.is_some_and(|o| produced_by(&existing, Some(o)));
        if owned {
            api.delete(name, &DeleteParams::default())
                .await
                .map_err(|e| map_kube_error(e, name, namespace))?;
            info!(
                destination.name = name,
                destination.namespace = namespace,
                "Deleted destination Secret"
            );
            return Ok(ClearOutcome::Removed);
        }

        let blank: BTreeMap<&str, &str> = keys::ALL.iter().map(|key| (*key, "")).collect();
        let patch = json!({ "stringData": blank });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| map_kube_error(e, name, namespace))?;
        info!(
            destination.name = name,
            destination.namespace = namespace,
            "Cleared certificate data from destination Secret"
        );
        Ok(ClearOutcome::Blanked)
    }
}

fn build_secret(name: &str, namespace: &str, record: &DestinationRecord) -> Secret {
    let mut labels = record.labels.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    let owner_references = record
        .provenance
        .as_ref()
        .and_then(|p| {
            p.uid.as_ref().map(|uid| OwnerReference {
                api_version: p.api_version.clone(),
                kind: p.kind.clone(),
                name: p.name.clone(),
                uid: uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            })
        })
        .map(|owner| vec![owner]);

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations_for(record)),
            owner_references,
            ..ObjectMeta::default()
        },
        string_data: Some(record.to_data()),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

fn annotations_for(record: &DestinationRecord) -> BTreeMap<String, String> {
    let mut annotations = record.annotations.clone();
    if let Some(provenance) = &record.provenance {
        annotations.insert(
            OWNER_API_VERSION_ANNOTATION.to_string(),
            provenance.api_version.clone(),
        );
        annotations.insert(OWNER_KIND_ANNOTATION.to_string(), provenance.kind.clone());
        annotations.insert(OWNER_NAME_ANNOTATION.to_string(), provenance.name.clone());
    }
    annotations
}

fn record_from_secret(secret: &Secret) -> DestinationRecord {
    let mut data: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    // stringData is only present on objects that never round-tripped through the API server
    if let Some(string_data) = &secret.string_data {
        data.extend(string_data.clone());
    }

    let mut record = DestinationRecord::from_data(&data);
    record.provenance = provenance_of(secret);
    record.labels = secret.metadata.labels.clone().unwrap_or_default();
    record.annotations = secret.metadata.annotations.clone().unwrap_or_default();
    record
}

fn provenance_of(secret: &Secret) -> Option<Provenance> {
    let annotations = secret.metadata.annotations.as_ref()?;
    let kind = annotations.get(OWNER_KIND_ANNOTATION)?;
    let name = annotations.get(OWNER_NAME_ANNOTATION)?;
    let uid = secret
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| &owner.kind == kind && &owner.name == name)
        .map(|owner| owner.uid.clone());

    Some(Provenance {
        api_version: annotations
            .get(OWNER_API_VERSION_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        kind: kind.clone(),
        name: name.clone(),
        uid,
    })
}

fn is_managed(secret: &Secret) -> bool {
    secret
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|value| value == MANAGED_BY_VALUE)
}

fn produced_by(secret: &Secret, provenance: Option<&Provenance>) -> bool {
    match (provenance_of(secret), provenance) {
        (Some(existing), Some(provenance)) => existing.same_producer(provenance),
        _ => false,
    }
}

fn map_kube_error(error: kube::Error, name: &str, namespace: &str) -> DestinationError {
    match error {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            DestinationError::not_found(name, namespace)
        }
        kube::Error::Api(api_err) if api_err.code == 409 => DestinationError::exists(name, namespace),
        kube::Error::Api(api_err) if api_err.code == 401 || api_err.code == 403 => {
            DestinationError::Denied {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason: api_err.message,
            }
        }
        other => DestinationError::Unavailable(other.to_string()),
    }
}
