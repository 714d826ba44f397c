use rivals_core::{is_blank_tag, ExternalId, User};
use rivals_storage::{Store, StoreError};
use tracing::debug;

/// Maps remote participants onto local users, creating placeholders on first sight.
#[derive(Debug, Clone)]
pub struct IdentityReconciler {
    store: Store,
}

impl IdentityReconciler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Returns the local user for `remote_user_id`.
    ///
    /// Safe to race: the write path is one upsert on the remote id unique key,
    /// and the tag only ever moves from blank to known.
    pub async fn resolve(
        &self,
        remote_user_id: ExternalId,
        candidate_tag: Option<&str>,
    ) -> Result<User, StoreError> {
        let candidate = candidate_tag.filter(|t| !is_blank_tag(t));

        if let Some(existing) = self.store.user_by_remote_id(remote_user_id).await? {
            let needs_tag = existing.tag.as_deref().map_or(true, is_blank_tag);
            if candidate.is_none() || !needs_tag {
                return Ok(existing);
            }
            debug!(remote_user_id, tag = candidate, "filling in missing tag");
        } else {
            debug!(remote_user_id, tag = candidate, "creating placeholder user");
        }

        self.store
            .upsert_placeholder_user(remote_user_id, candidate)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivals_core::UNKNOWN_PLAYER_TAG;
    use rivals_storage::NewUser;

    #[tokio::test]
    async fn tag_is_upgraded_once_and_never_blanked() {
        let store = Store::in_memory().await.unwrap();
        let reconciler = IdentityReconciler::new(store.clone());

        let first = reconciler.resolve(88, None).await.unwrap();
        assert_eq!(first.tag.as_deref(), Some(UNKNOWN_PLAYER_TAG));

        let second = reconciler.resolve(88, Some("Foo")).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.tag.as_deref(), Some("Foo"));

        let third = reconciler.resolve(88, None).await.unwrap();
        assert_eq!(third.tag.as_deref(), Some("Foo"));
        assert_eq!(store.counts().await.unwrap().users, 1);
    }

    #[tokio::test]
    async fn known_users_are_returned_as_is() {
        let store = Store::in_memory().await.unwrap();
        let real = store
            .register_user(&NewUser {
                email: "hero@example.com".into(),
                remote_id: Some(77),
                tag: Some("Hero".into()),
                access_token: Some("tok".into()),
            })
            .await
            .unwrap();
        let reconciler = IdentityReconciler::new(store.clone());

        let resolved = reconciler.resolve(77, Some("Someone Else")).await.unwrap();
        assert_eq!(resolved.id, real.id);
        assert_eq!(resolved.tag.as_deref(), Some("Hero"));
        assert!(!resolved.is_placeholder);
    }

    #[tokio::test]
    async fn concurrent_resolution_yields_a_single_user() {
        let store = Store::in_memory().await.unwrap();
        let reconciler = IdentityReconciler::new(store.clone());

        let (a, b) = tokio::join!(reconciler.resolve(88, Some("Rival")), reconciler.resolve(88, None));
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(store.counts().await.unwrap().users, 1);
    }
}
