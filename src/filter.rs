//! Event filtering for secondary watches
//!
//! ConfigMaps and Secrets are not owned by a KbsConfig, so every change in the
//! cluster would otherwise wake the controller. Predicates decide which of
//! those changes are worth a reconcile.

use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use crate::crd::KbsConfig;

/// A change observed on a watched object
#[derive(Debug)]
pub enum ChangeEvent<'a, K> {
    /// Object was created
    Create(&'a K),
    /// Object was modified
    Update {
        /// Previous state, if known
        old: Option<&'a K>,
        /// Current state
        new: &'a K,
    },
    /// Object was deleted
    Delete(&'a K),
    /// Resync or other event not tied to a specific change
    Generic(&'a K),
}

impl<'a, K> ChangeEvent<'a, K> {
    /// The object the event is about (the new state for updates)
    pub fn object(&self) -> &'a K {
        match self {
            Self::Create(obj) | Self::Delete(obj) | Self::Generic(obj) => obj,
            Self::Update { new, .. } => new,
        }
    }
}

/// Decides whether a change event should trigger a reconcile
pub trait EventPredicate<K>: Send + Sync {
    /// Whether the event passes the filter
    fn admit(&self, event: &ChangeEvent<'_, K>) -> bool;
}

/// Admits events for objects in one namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespacePredicate {
    namespace: String,
}

impl NamespacePredicate {
    /// Admit only objects in `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace events must belong to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl<K: ResourceExt> EventPredicate<K> for NamespacePredicate {
    fn admit(&self, event: &ChangeEvent<'_, K>) -> bool {
        event.object().namespace().as_deref() == Some(self.namespace.as_str())
    }
}

/// KbsConfigs to reconcile after an admitted change
///
/// Every cached KbsConfig in the namespace of the changed object is returned.
/// Events the predicate rejects map to nothing.
///
/// The controller runtime hands watch mappers the object alone, without the
/// kind of change, so the operator always passes [`ChangeEvent::Generic`].
/// The other variants exist for callers that do know the change kind.
///
/// With a [`NamespacePredicate`] only records in the operator namespace are
/// ever returned. A KbsConfig elsewhere that is waiting on a missing artifact
/// is not woken when the artifact appears; it picks it up on its next
/// backoff requeue.
pub fn affected_records<K, P>(
    store: &Store<KbsConfig>,
    predicate: &P,
    event: &ChangeEvent<'_, K>,
) -> Vec<ObjectRef<KbsConfig>>
where
    K: ResourceExt,
    P: EventPredicate<K> + ?Sized,
{
    if !predicate.admit(event) {
        return vec![];
    }
    let namespace = event.object().namespace();
    store
        .state()
        .iter()
        .filter(|record| record.namespace() == namespace)
        .map(|record| ObjectRef::from_obj(record.as_ref()))
        .collect()
}
