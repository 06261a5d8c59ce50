use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    models::{
        network::{
            DownlineCount, LevelResult, MissingReferralQuery, NetworkNode, NetworkQuery,
            NetworkSnapshot, NetworkTotals, Page, SortBy, SortOrder,
        },
        users::{
            SponsorChange, SponsorChangeKind, SponsorWrite, SponsorWriteOutcome, User,
            UserDetails, UserMatch,
        },
    },
    repositories::users::{UserStore, ANCESTRY_HOP_LIMIT},
    settings::Network,
};

use super::ServiceError;

pub const MIN_DEPTH: i64 = 1;
pub const MAX_DEPTH: i64 = 10;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_SEARCH_LIMIT: i64 = 10;
const MAX_SEARCH_LIMIT: i64 = 50;
const MAX_SPONSOR_WRITE_ATTEMPTS: usize = 3;

const CYCLE_MESSAGE: &str = "would create a referral cycle";

fn repository_error(e: anyhow::Error) -> ServiceError {
    log::error!("User repository failure: {:#}", e);
    ServiceError::Repository("NetworkService".to_string(), e.to_string())
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Sponsor tree reads and lineage repairs over a `UserStore`.
pub struct NetworkEngine<S: ?Sized> {
    store: Arc<S>,
    settings: Network,
}

impl<S: ?Sized> Clone for NetworkEngine<S> {
    fn clone(&self) -> Self {
        NetworkEngine {
            store: self.store.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S: UserStore + ?Sized> NetworkEngine<S> {
    pub fn new(store: Arc<S>, settings: Network) -> Self {
        NetworkEngine { store, settings }
    }

    /// Walks the sponsor tree below the resolved root, one level per store
    /// round trip.
    pub async fn get_network(&self, query: &NetworkQuery) -> Result<NetworkSnapshot, ServiceError> {
        let depth = query.depth.unwrap_or(self.settings.default_depth);
        if !(MIN_DEPTH..=MAX_DEPTH).contains(&depth) {
            return Err(ServiceError::InvalidArgument(format!(
                "depth must be between {} and {}, got {}",
                MIN_DEPTH, MAX_DEPTH, depth
            )));
        }
        if query.filter.registration.is_inverted() {
            return Err(ServiceError::InvalidArgument(
                "registration_from is after registration_to".to_string(),
            ));
        }

        let limit = query
            .limit_per_level
            .unwrap_or(self.settings.default_limit_per_level)
            .clamp(1, self.settings.max_limit_per_level.max(1)) as usize;

        let root = self.resolve_root(query).await?;
        let packages = self.store.list_packages().await.map_err(repository_error)?;
        let package_names: HashMap<String, String> = packages
            .iter()
            .map(|p| (p.id.clone(), p.name.clone()))
            .collect();

        let mut visited = HashSet::from([root.id.clone()]);
        let mut frontier = vec![root.id.clone()];
        let mut walked: Vec<(u32, Vec<User>, usize)> = Vec::new();

        for level in 1..=depth as u32 {
            let children = self
                .store
                .get_children(&frontier)
                .await
                .map_err(repository_error)?;

            let children: Vec<User> = children
                .into_iter()
                .filter(|user| visited.insert(user.id.clone()))
                .collect();
            if children.is_empty() {
                break;
            }

            // Hidden nodes still carry the walk to the next level.
            frontier = children.iter().map(|user| user.id.clone()).collect();

            let mut visible: Vec<User> = children
                .into_iter()
                .filter(|user| query.filter.admits(user))
                .collect();
            sort_level(&mut visible, query.sort_by, query.sort_order, &package_names);

            let total = visible.len();
            visible.truncate(limit);
            walked.push((level, visible, total));
        }

        let mut shown_ids = vec![root.id.clone()];
        shown_ids.extend(
            walked
                .iter()
                .flat_map(|(_, users, _)| users.iter().map(|user| user.id.clone())),
        );
        let counts = self
            .store
            .downline_counts(&shown_ids, self.settings.downline_depth_cap)
            .await
            .map_err(repository_error)?;

        let to_node = |user: User| -> NetworkNode {
            let count = counts.get(&user.id).copied().unwrap_or_default();
            network_node(user, count, &package_names)
        };

        let totals = NetworkTotals {
            total_nodes: walked.iter().map(|(_, _, total)| total).sum(),
            levels: walked.len(),
        };
        let levels = walked
            .into_iter()
            .map(|(level, users, total)| LevelResult {
                level,
                truncated: total > users.len(),
                nodes: users.into_iter().map(&to_node).collect(),
                total,
            })
            .collect();

        log::debug!(
            "Network from {} reached {} levels with {} nodes.",
            root.id,
            totals.levels,
            totals.total_nodes
        );

        Ok(NetworkSnapshot {
            root: to_node(root),
            levels,
            packages,
            totals,
        })
    }

    /// Looks a user up by id, then by legacy id.
    pub async fn resolve_user(&self, identifier: &str) -> Result<Option<User>, ServiceError> {
        let identifier = identifier.trim();

        if let Some(user) = self
            .store
            .get_user_by_id(identifier)
            .await
            .map_err(repository_error)?
        {
            return Ok(Some(user));
        }

        self.store
            .get_user_by_legacy_id(identifier)
            .await
            .map_err(repository_error)
    }

    async fn resolve_root(&self, query: &NetworkQuery) -> Result<User, ServiceError> {
        if let Some(identifier) = non_blank(&query.root_user_id) {
            return self
                .resolve_user(identifier)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("root user {}", identifier)));
        }

        if let Some(email) = non_blank(&query.email) {
            return self
                .store
                .get_user_by_email(email)
                .await
                .map_err(repository_error)?
                .ok_or_else(|| ServiceError::NotFound(format!("user with email {}", email)));
        }

        if let Some(anchor) = non_blank(&self.settings.anchor_user_id) {
            return self
                .store
                .get_user_by_id(anchor)
                .await
                .map_err(repository_error)?
                .ok_or_else(|| ServiceError::NotFound(format!("anchor user {}", anchor)));
        }

        self.store
            .get_default_root()
            .await
            .map_err(repository_error)?
            .ok_or_else(|| ServiceError::NotFound("network root".to_string()))
    }

    async fn require_user(&self, id: &str, role: &str) -> Result<User, ServiceError> {
        self.store
            .get_user_by_id(id)
            .await
            .map_err(repository_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("{} {}", role, id)))
    }

    pub async fn get_user_details(&self, identifier: &str) -> Result<UserDetails, ServiceError> {
        let user = self
            .resolve_user(identifier)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", identifier)))?;

        let count = self
            .store
            .downline_counts(&[user.id.clone()], self.settings.downline_depth_cap)
            .await
            .map_err(repository_error)?
            .remove(&user.id)
            .unwrap_or_default();

        Ok(UserDetails {
            user,
            direct_referrals: count.direct,
            downline_size: count.total,
        })
    }

    pub async fn missing_referrals(
        &self,
        query: &MissingReferralQuery,
    ) -> Result<Page<User>, ServiceError> {
        if query.filter.registration.is_inverted() {
            return Err(ServiceError::InvalidArgument(
                "registration_from is after registration_to".to_string(),
            ));
        }

        let page = query.page.unwrap_or(1).max(1);
        let page_size = query
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let (items, total) = self
            .store
            .missing_referrals(
                non_blank(&query.search),
                &query.filter,
                non_blank(&self.settings.anchor_user_id),
                (page - 1).saturating_mul(page_size),
                page_size,
            )
            .await
            .map_err(repository_error)?;

        Ok(Page::new(items, total, page, page_size))
    }

    pub async fn search_users(
        &self,
        query: &str,
        limit: Option<i64>,
    ) -> Result<Vec<UserMatch>, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(vec![]);
        }

        let limit = limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);

        self.store
            .search_users(query, limit)
            .await
            .map_err(repository_error)
    }

    async fn ensure_acyclic(&self, user_id: &str, sponsor_id: &str) -> Result<(), ServiceError> {
        let ancestors = self
            .store
            .get_ancestor_ids(sponsor_id, ANCESTRY_HOP_LIMIT)
            .await
            .map_err(repository_error)?;

        if ancestors.iter().any(|id| id == user_id) {
            return Err(ServiceError::InvalidOperation(CYCLE_MESSAGE.to_string()));
        }

        Ok(())
    }

    /// `Ok(None)` means the sponsor moved since it was read.
    async fn write_sponsor(&self, write: SponsorWrite) -> Result<Option<User>, ServiceError> {
        match self
            .store
            .set_sponsor(&write)
            .await
            .map_err(repository_error)?
        {
            SponsorWriteOutcome::Applied(user) => Ok(Some(user)),
            SponsorWriteOutcome::Stale => Ok(None),
            SponsorWriteOutcome::WouldCycle => {
                Err(ServiceError::InvalidOperation(CYCLE_MESSAGE.to_string()))
            }
            SponsorWriteOutcome::UserMissing => {
                Err(ServiceError::NotFound(format!("user {}", write.user_id)))
            }
            SponsorWriteOutcome::SponsorMissing => {
                Err(ServiceError::NotFound(format!("sponsor {}", write.sponsor_id)))
            }
        }
    }

    pub async fn reassign_sponsor(
        &self,
        user_id: &str,
        new_sponsor_id: &str,
    ) -> Result<User, ServiceError> {
        if user_id == new_sponsor_id {
            return Err(ServiceError::InvalidOperation(
                "a user cannot sponsor themselves".to_string(),
            ));
        }

        for attempt in 1..=MAX_SPONSOR_WRITE_ATTEMPTS {
            let user = self.require_user(user_id, "user").await?;
            let sponsor = self.require_user(new_sponsor_id, "sponsor").await?;

            if user.sponsor_id.as_deref() == Some(sponsor.id.as_str()) {
                return Err(ServiceError::InvalidOperation(format!(
                    "{} is already sponsored by {}",
                    user.id, sponsor.id
                )));
            }
            self.ensure_acyclic(&user.id, &sponsor.id).await?;

            let write = SponsorWrite {
                user_id: user.id.clone(),
                expected_sponsor_id: user.sponsor_id.clone(),
                sponsor_id: sponsor.id.clone(),
                kind: SponsorChangeKind::Reassign,
            };
            if let Some(updated) = self.write_sponsor(write).await? {
                log::info!(
                    "Reassigned sponsor of {} from {:?} to {}.",
                    updated.id,
                    user.sponsor_id,
                    sponsor.id
                );
                return Ok(updated);
            }

            log::warn!(
                "Sponsor of {} changed concurrently (attempt {}).",
                user.id,
                attempt
            );
        }

        Err(ServiceError::Conflict(format!(
            "sponsor of {} kept changing, try again",
            user_id
        )))
    }

    pub async fn resolve_missing_referral(
        &self,
        user_id: &str,
        sponsor_id: &str,
    ) -> Result<User, ServiceError> {
        if user_id == sponsor_id {
            return Err(ServiceError::InvalidOperation(
                "a user cannot sponsor themselves".to_string(),
            ));
        }

        for attempt in 1..=MAX_SPONSOR_WRITE_ATTEMPTS {
            let user = self.require_user(user_id, "user").await?;
            if user.sponsor_id.is_some() {
                return Err(ServiceError::InvalidOperation(format!(
                    "{} already has a sponsor, use reassignment instead",
                    user.id
                )));
            }

            let sponsor = self.require_user(sponsor_id, "sponsor").await?;
            self.ensure_acyclic(&user.id, &sponsor.id).await?;

            let write = SponsorWrite {
                user_id: user.id.clone(),
                expected_sponsor_id: None,
                sponsor_id: sponsor.id.clone(),
                kind: SponsorChangeKind::Resolve,
            };
            if let Some(updated) = self.write_sponsor(write).await? {
                log::info!("Attached {} to sponsor {}.", updated.id, sponsor.id);
                return Ok(updated);
            }

            log::warn!(
                "Sponsor of {} changed concurrently (attempt {}).",
                user.id,
                attempt
            );
        }

        Err(ServiceError::Conflict(format!(
            "sponsor of {} kept changing, try again",
            user_id
        )))
    }

    pub async fn sponsor_history(&self, user_id: &str) -> Result<Vec<SponsorChange>, ServiceError> {
        let user = self.require_user(user_id, "user").await?;

        self.store
            .sponsor_history(&user.id)
            .await
            .map_err(repository_error)
    }
}

fn network_node(
    user: User,
    count: DownlineCount,
    package_names: &HashMap<String, String>,
) -> NetworkNode {
    let package_name = user
        .package_id
        .as_ref()
        .and_then(|id| package_names.get(id).cloned());

    NetworkNode {
        id: user.id,
        name: user.name,
        email: user.email,
        legacy_id: user.legacy_id,
        package_id: user.package_id,
        package_name,
        created_at: user.created_at,
        sponsor_id: user.sponsor_id,
        direct_referrals: count.direct,
        downline_size: count.total,
    }
}

fn compare_packages(a: &User, b: &User, package_names: &HashMap<String, String>) -> Ordering {
    let key = |user: &User| {
        user.package_id
            .as_ref()
            .map(|id| package_names.get(id).unwrap_or(id).clone())
    };

    match (key(a), key(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn sort_level(
    users: &mut [User],
    sort_by: SortBy,
    order: SortOrder,
    package_names: &HashMap<String, String>,
) {
    users.sort_by(|a, b| {
        let ordering = match sort_by {
            SortBy::Registration => a.created_at.cmp(&b.created_at),
            SortBy::Package => compare_packages(a, b, package_names)
                .then_with(|| a.created_at.cmp(&b.created_at)),
        }
        .then_with(|| a.id.cmp(&b.id));

        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}
