//! Desired/actual convergence.
//!
//! The core reconciliation step shared by the service and ingress
//! controllers: diff a computed desired collection against the stored
//! objects owned by the calling reconciler and issue the minimal set of
//! writes. Creates run first, then updates, then deletes, so an object
//! being renamed never transits through a not-found state. A failed write
//! aborts the remainder of its category; applied writes stay applied and
//! the next pass self-heals.

use crate::{ObjectClient, StorableObject, StorageError};
use config_api::generated_by;
use kube::ResourceExt;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteOp::Create => "create",
            WriteOp::Update => "update",
            WriteOp::Delete => "delete",
        })
    }
}

/// A reconciliation pass failure. Non-fatal to the owning controller: the
/// next trigger re-runs the pass from scratch.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Desired-state computation failed
    #[error("failed to compute desired state: {0}")]
    Desired(#[source] anyhow::Error),

    /// The platform lister failed
    #[error("failed to list platform resources: {0}")]
    Platform(#[source] anyhow::Error),

    /// Listing the stored objects failed
    #[error("failed to list {kind}: {source}")]
    List {
        kind: String,
        #[source]
        source: StorageError,
    },

    /// A converge write failed; remaining writes in the category were
    /// skipped
    #[error("failed to {op} {kind} {name}: {source}")]
    Write {
        op: WriteOp,
        kind: String,
        name: String,
        #[source]
        source: StorageError,
    },
}

fn write_err<T: StorableObject>(op: WriteOp, name: &str, source: StorageError) -> ReconcileError {
    ReconcileError::Write {
        op,
        kind: T::kind(&()).into_owned(),
        name: name.to_string(),
        source,
    }
}

/// Lists the stored objects whose ownership annotation equals
/// `generated_by`; everything else is invisible to the caller's diff.
pub async fn list_owned<T: StorableObject>(
    client: &dyn ObjectClient<T>,
    owner: &str,
) -> Result<Vec<T>, ReconcileError> {
    let all = client.list().await.map_err(|source| ReconcileError::List {
        kind: T::kind(&()).into_owned(),
        source,
    })?;
    Ok(all
        .into_iter()
        .filter(|obj| generated_by(obj.meta()) == Some(owner))
        .collect())
}

/// Makes the stored collection match `desired`.
///
/// `actual` must already be scoped to the caller's own objects (see
/// [`list_owned`]). `tolerate_existing` treats `AlreadyExists` on create as
/// success, for object kinds several reconcilers legitimately race on.
pub async fn converge<T: StorableObject>(
    desired: Vec<T>,
    actual: Vec<T>,
    client: &dyn ObjectClient<T>,
    tolerate_existing: bool,
) -> Result<(), ReconcileError> {
    let mut remaining: HashMap<String, T> = actual
        .into_iter()
        .map(|obj| (obj.name_any(), obj))
        .collect();

    let mut to_create = Vec::new();
    let mut to_update = Vec::new();
    for mut obj in desired {
        match remaining.remove(&obj.name_any()) {
            // desired but not stored
            None => to_create.push(obj),
            Some(current) => {
                if !obj.spec_eq(&current) {
                    // keep the stored identity (version, annotations) and
                    // only move the spec forward
                    *obj.meta_mut() = current.meta().clone();
                    to_update.push(obj);
                }
            }
        }
    }

    for obj in to_create {
        let name = obj.name_any();
        debug!(name, "creating {}", T::kind(&()));
        match client.create(&obj).await {
            Ok(_) => {}
            Err(err) if tolerate_existing && err.is_already_exists() => {
                debug!(name, "already exists, leaving in place");
            }
            Err(err) => return Err(write_err::<T>(WriteOp::Create, &name, err)),
        }
    }
    for obj in to_update {
        let name = obj.name_any();
        debug!(name, "updating {}", T::kind(&()));
        client
            .update(&obj)
            .await
            .map_err(|err| write_err::<T>(WriteOp::Update, &name, err))?;
    }
    // whatever was matched by nothing desired is no longer wanted
    for name in remaining.into_keys() {
        debug!(name, "deleting {}", T::kind(&()));
        client
            .delete(&name)
            .await
            .map_err(|err| write_err::<T>(WriteOp::Delete, &name, err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryClient, RecordedOp};
    use config_api::{Upstream, UpstreamSpec, mark_generated_by};
    use kube::Resource;

    const OWNER: &str = "test-reconciler";

    fn upstream(name: &str, version_tag: &str, owner: Option<&str>) -> Upstream {
        let mut us = Upstream::new(
            name,
            UpstreamSpec {
                upstream_type: "kubernetes".to_string(),
                config: serde_json::json!({"rev": version_tag}),
            },
        );
        if let Some(owner) = owner {
            mark_generated_by(us.meta_mut(), owner);
        }
        us
    }

    #[tokio::test]
    async fn diff_issues_the_minimal_write_set() {
        let client = MemoryClient::new();
        client.seed(upstream("a", "v1", Some(OWNER)));
        client.seed(upstream("c", "v1", Some(OWNER)));
        client.take_ops();

        let desired = vec![
            upstream("a", "v2", Some(OWNER)),
            upstream("b", "v1", Some(OWNER)),
        ];
        let actual = list_owned(&client, OWNER).await.unwrap();
        converge(desired, actual, &client, false).await.unwrap();

        assert_eq!(
            client.take_ops(),
            vec![
                RecordedOp::Create("b".to_string()),
                RecordedOp::Update("a".to_string()),
                RecordedOp::Delete("c".to_string()),
            ]
        );

        let stored = client.objects();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored["a"].spec.config["rev"], "v2");
        assert_eq!(stored["b"].spec.config["rev"], "v1");
    }

    #[tokio::test]
    async fn second_pass_over_unchanged_state_is_a_no_op() {
        let client = MemoryClient::new();
        let desired = vec![
            upstream("a", "v1", Some(OWNER)),
            upstream("b", "v1", Some(OWNER)),
        ];

        let actual = list_owned(&client, OWNER).await.unwrap();
        converge(desired.clone(), actual, &client, false)
            .await
            .unwrap();
        client.take_ops();

        let actual = list_owned(&client, OWNER).await.unwrap();
        converge(desired, actual, &client, false).await.unwrap();
        assert!(client.take_ops().is_empty());
    }

    #[tokio::test]
    async fn foreign_objects_are_invisible_to_the_diff() {
        let client = MemoryClient::new();
        client.seed(upstream("user-made", "v1", None));
        client.seed(upstream("other-owner", "v1", Some("someone-else")));
        client.take_ops();

        let actual = list_owned(&client, OWNER).await.unwrap();
        assert!(actual.is_empty());

        converge(Vec::new(), actual, &client, false).await.unwrap();
        assert!(client.take_ops().is_empty());
        // both foreign objects survive an empty desired set
        assert_eq!(client.objects().len(), 2);
    }

    #[tokio::test]
    async fn name_collision_with_a_foreign_object_is_tolerated_for_shared_kinds() {
        let client = MemoryClient::new();
        client.seed(upstream("shared", "v1", Some("someone-else")));
        client.take_ops();

        let desired = vec![upstream("shared", "v1", Some(OWNER))];
        let actual = list_owned(&client, OWNER).await.unwrap();
        converge(desired, actual, &client, true).await.unwrap();

        // no write went through and the foreign object is untouched
        assert!(client.take_ops().is_empty());
        assert_eq!(
            generated_by(client.objects()["shared"].meta()),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn updates_preserve_the_stored_metadata() {
        let client = MemoryClient::new();
        client.seed(upstream("a", "v1", Some(OWNER)));
        let stored_version = client.objects()["a"].metadata.resource_version.clone();
        client.take_ops();

        // desired objects are computed fresh and carry no resource version
        let desired = vec![upstream("a", "v2", Some(OWNER))];
        let actual = list_owned(&client, OWNER).await.unwrap();
        converge(desired, actual, &client, false).await.unwrap();

        // the update presented the stored version (else MemoryClient would
        // have refused it) and the object moved forward
        let after = client.objects()["a"].clone();
        assert_ne!(after.metadata.resource_version, stored_version);
        assert_eq!(after.spec.config["rev"], "v2");
    }

    #[tokio::test]
    async fn failed_update_aborts_remaining_updates_but_keeps_applied_writes() {
        let client = MemoryClient::new();
        client.seed(upstream("a", "v1", Some(OWNER)));
        client.seed(upstream("b", "v1", Some(OWNER)));
        client.take_ops();

        let desired = vec![
            upstream("a", "v2", Some(OWNER)),
            upstream("b", "v2", Some(OWNER)),
            upstream("c", "v1", Some(OWNER)),
        ];
        let actual = list_owned(&client, OWNER).await.unwrap();
        client.fail_updates();
        let err = converge(desired, actual, &client, false).await.unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Write {
                op: WriteOp::Update,
                ..
            }
        ));
        // the create ran (creates precede updates), neither update landed
        assert_eq!(client.take_ops(), vec![RecordedOp::Create("c".to_string())]);
    }
}
