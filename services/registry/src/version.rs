//! Copy-on-write repository versions.
//!
//! A [`NewVersion`] is a working copy of the latest published version. Adds
//! and removals apply to the working set in call order; [`NewVersion::commit`]
//! publishes the result as the next version number. Dropping the handle
//! without committing publishes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;

use crate::content::{Content, ContentId, Repository, RepositoryVersion};
use crate::db::Database;
use crate::error::{RegistryError, RegistryResult};
use crate::reservation::{Reservation, Reservations, Resource};

/// Wire token meaning "every unit in the repository".
pub const REMOVE_ALL: &str = "*";

/// Units to remove from a working version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Everything currently in the working set.
    All,
    /// Only the listed units.
    Units(BTreeSet<ContentId>),
}

impl Removal {
    /// Parse wire tokens: either exactly `["*"]` or a list of content ids.
    pub fn parse<I, S>(items: I) -> RegistryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items: Vec<S> = items.into_iter().collect();
        if items.iter().any(|item| item.as_ref() == REMOVE_ALL) {
            if items.len() != 1 {
                return Err(RegistryError::InvalidRequest(
                    "'*' must be the only item in remove_content_units".into(),
                ));
            }
            return Ok(Removal::All);
        }

        items
            .iter()
            .map(|item| {
                item.as_ref().parse::<ContentId>().map_err(|_| {
                    RegistryError::InvalidRequest(format!("not a content id: {}", item.as_ref()))
                })
            })
            .collect::<RegistryResult<BTreeSet<_>>>()
            .map(Removal::Units)
    }
}

/// Creates version scopes, one at a time per repository.
#[derive(Debug, Clone)]
pub struct Versions {
    db: Arc<dyn Database>,
    reservations: Reservations,
}

impl Versions {
    /// Version scopes over `db`, serialized through `reservations`.
    pub fn new(db: Arc<dyn Database>, reservations: Reservations) -> Self {
        Self { db, reservations }
    }

    /// Open a scope on `repository`, waiting for any other open scope to finish.
    #[tracing::instrument(skip_all, fields(repository = %repository.name))]
    pub async fn new_version(&self, repository: &Repository) -> RegistryResult<NewVersion> {
        let reservation = self
            .reservations
            .acquire(Resource::Repository(repository.id))
            .await;
        let base = self.db.latest_version(repository.id).await?;
        tracing::trace!(base = base.number, "opened version scope");

        Ok(NewVersion {
            db: self.db.clone(),
            content: base.content.clone(),
            added: Vec::new(),
            base,
            committed: false,
            _reservation: reservation,
        })
    }
}

/// A mutable working copy of a repository version.
#[derive(Debug)]
pub struct NewVersion {
    db: Arc<dyn Database>,
    base: RepositoryVersion,
    content: BTreeSet<ContentId>,
    added: Vec<ContentId>,
    committed: bool,
    _reservation: Reservation,
}

impl NewVersion {
    /// The version this scope started from.
    pub fn base(&self) -> &RepositoryVersion {
        &self.base
    }

    /// The current working set.
    pub fn content(&self) -> &BTreeSet<ContentId> {
        &self.content
    }

    /// Add units to the working set.
    pub fn add_content<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = ContentId>,
    {
        for id in ids {
            self.content.insert(id);
            self.added.retain(|added| *added != id);
            self.added.push(id);
        }
    }

    /// Remove units from the working set.
    pub fn remove_content(&mut self, removal: Removal) {
        match removal {
            Removal::All => {
                self.content.clear();
                self.added.clear();
            }
            Removal::Units(ids) => {
                self.content.retain(|id| !ids.contains(id));
                self.added.retain(|id| !ids.contains(id));
            }
        }
    }

    /// Ids of tags in the working set named `name`.
    pub async fn tags_named(&self, name: &str) -> RegistryResult<BTreeSet<ContentId>> {
        Ok(self
            .db
            .content(&self.content)
            .await?
            .iter()
            .filter_map(Content::as_tag)
            .filter(|tag| tag.name == name)
            .map(|tag| tag.id)
            .collect())
    }

    /// Keep one tag per name, preferring the most recently added one.
    async fn remove_duplicate_tags(&mut self) -> RegistryResult<()> {
        let units = self.db.content(&self.content).await?;
        let mut by_name: BTreeMap<&str, Vec<ContentId>> = BTreeMap::new();
        for tag in units.iter().filter_map(Content::as_tag) {
            by_name.entry(&tag.name).or_default().push(tag.id);
        }

        let rank = |id: &ContentId| self.added.iter().position(|added| added == id);
        let mut losers = BTreeSet::new();
        for (name, ids) in by_name.into_iter().filter(|(_, ids)| ids.len() > 1) {
            let Some(winner) = ids.iter().copied().max_by_key(|id| (rank(id), *id)) else {
                continue;
            };
            tracing::debug!(tag = name, "replacing duplicate tags");
            losers.extend(ids.into_iter().filter(|id| *id != winner));
        }

        if !losers.is_empty() {
            self.remove_content(Removal::Units(losers));
        }
        Ok(())
    }

    /// Publish the working set as the next version.
    ///
    /// Returns the base unchanged when nothing was added or removed.
    #[tracing::instrument(skip(self), fields(repository = %self.base.repository, base = self.base.number))]
    pub async fn commit(mut self) -> RegistryResult<RepositoryVersion> {
        self.remove_duplicate_tags().await?;

        let added: BTreeSet<ContentId> =
            self.content.difference(&self.base.content).copied().collect();
        let removed: BTreeSet<ContentId> =
            self.base.content.difference(&self.content).copied().collect();

        if added.is_empty() && removed.is_empty() {
            self.committed = true;
            tracing::debug!("no changes, keeping base version");
            return Ok(self.base.clone());
        }

        let version = RepositoryVersion {
            repository: self.base.repository,
            number: self.base.number + 1,
            content: std::mem::take(&mut self.content),
            added,
            removed,
            created: Utc::now(),
        };

        let version = self.db.publish_version(version).await?;
        self.committed = true;
        tracing::debug!(
            number = version.number,
            added = version.added.len(),
            removed = version.removed.len(),
            "published repository version"
        );
        Ok(version)
    }
}

impl Drop for NewVersion {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(
                repository = %self.base.repository,
                base = self.base.number,
                "discarding uncommitted repository version"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{RepositoryId, Tag};
    use crate::db::MemoryDatabase;

    async fn setup() -> (Arc<dyn Database>, Versions, Repository) {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let repo = db
            .insert_repository(Repository {
                id: RepositoryId::new(),
                name: "app".into(),
                created: Utc::now(),
            })
            .await
            .unwrap();
        let versions = Versions::new(db.clone(), Reservations::new());
        (db, versions, repo)
    }

    async fn tag(db: &Arc<dyn Database>, name: &str) -> Tag {
        db.insert_tag(Tag {
            id: ContentId::new(),
            name: name.into(),
            tagged_manifest: ContentId::new(),
        })
        .await
        .unwrap()
    }

    #[test]
    fn removal_tokens() {
        assert_eq!(Removal::parse(["*"]).unwrap(), Removal::All);
        assert!(matches!(
            Removal::parse(["*", "abc"]),
            Err(RegistryError::InvalidRequest(_))
        ));
        assert!(Removal::parse(["not-an-id"]).is_err());

        let id = ContentId::new();
        assert_eq!(
            Removal::parse([id.to_string()]).unwrap(),
            Removal::Units([id].into())
        );
    }

    #[tokio::test]
    async fn operations_apply_in_order() {
        let (_db, versions, repo) = setup().await;
        let (a, b) = (ContentId::new(), ContentId::new());

        let mut version = versions.new_version(&repo).await.unwrap();
        version.add_content([a, b]);
        version.remove_content(Removal::Units([a].into()));
        version.add_content([a]);
        let v1 = version.commit().await.unwrap();
        assert_eq!(v1.number, 1);
        assert_eq!(v1.content, [a, b].into());

        let mut version = versions.new_version(&repo).await.unwrap();
        version.add_content([ContentId::new()]);
        version.remove_content(Removal::All);
        let v2 = version.commit().await.unwrap();
        assert_eq!(v2.number, 2);
        assert!(v2.content.is_empty());
        assert_eq!(v2.removed, [a, b].into());
    }

    #[tokio::test]
    async fn unchanged_scope_returns_base() {
        let (db, versions, repo) = setup().await;
        let version = versions.new_version(&repo).await.unwrap();
        let result = version.commit().await.unwrap();
        assert_eq!(result.number, 0);
        assert_eq!(db.versions(repo.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_scope_publishes_nothing() {
        let (db, versions, repo) = setup().await;
        {
            let mut version = versions.new_version(&repo).await.unwrap();
            version.add_content([ContentId::new()]);
        }
        assert_eq!(db.latest_version(repo.id).await.unwrap().number, 0);
    }

    #[tokio::test]
    async fn newly_added_tag_replaces_same_name() {
        let (db, versions, repo) = setup().await;
        let old = tag(&db, "latest").await;
        let new = tag(&db, "latest").await;
        let other = tag(&db, "stable").await;

        let mut version = versions.new_version(&repo).await.unwrap();
        version.add_content([old.id, other.id]);
        version.commit().await.unwrap();

        let mut version = versions.new_version(&repo).await.unwrap();
        version.add_content([new.id]);
        let published = version.commit().await.unwrap();

        assert_eq!(published.content, [new.id, other.id].into());
        assert_eq!(published.removed, [old.id].into());
        assert_eq!(
            db.tag_by_name_and_manifest("latest", old.tagged_manifest)
                .await
                .unwrap(),
            old
        );
    }

    #[tokio::test]
    async fn stale_base_is_a_conflict() {
        let (db, versions, repo) = setup().await;
        // A second process sharing the store but not the reservations.
        let elsewhere = Versions::new(db.clone(), Reservations::new());

        let mut ours = versions.new_version(&repo).await.unwrap();
        let mut theirs = elsewhere.new_version(&repo).await.unwrap();
        theirs.add_content([ContentId::new()]);
        theirs.commit().await.unwrap();

        ours.add_content([ContentId::new()]);
        let err = ours.commit().await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
        assert_eq!(db.latest_version(repo.id).await.unwrap().number, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_scopes_do_not_lose_updates() {
        let (db, versions, repo) = setup().await;

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let versions = versions.clone();
                let repo = repo.clone();
                tokio::spawn(async move {
                    let id = ContentId::new();
                    let mut version = versions.new_version(&repo).await.unwrap();
                    version.add_content([id]);
                    version.commit().await.unwrap();
                    id
                })
            })
            .collect();

        let mut expected = BTreeSet::new();
        for task in tasks {
            expected.insert(task.await.unwrap());
        }

        let latest = db.latest_version(repo.id).await.unwrap();
        assert_eq!(latest.number, 16);
        assert_eq!(latest.content, expected);
    }
}
