use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use tokio::sync::Barrier;

use super::users::{UserStore, ANCESTRY_HOP_LIMIT};
use crate::models::{
    network::{DownlineCount, NodeFilter},
    users::{Package, SponsorChange, SponsorWrite, SponsorWriteOutcome, User, UserMatch},
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    packages: Vec<Package>,
    changes: Vec<SponsorChange>,
    /// Sponsor moves applied right before the next `set_sponsor` calls.
    interleaved_moves: VecDeque<(String, Option<String>)>,
}

/// In-process `UserStore` for tests. Users registered through `add_user`
/// get one day of registration spacing, in insertion order.
#[derive(Default)]
pub struct MemoryUserStore {
    state: RwLock<MemoryState>,
    write_gate: Mutex<Option<Arc<Barrier>>>,
}

pub fn registration_day(day: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
        + Duration::days(day)
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&self, id: &str, name: &str) {
        self.state.write().unwrap().packages.push(Package {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_user(&self, id: &str, sponsor_id: Option<&str>) -> User {
        let day = self.state.read().unwrap().users.len() as i64;
        self.insert(User {
            id: id.to_string(),
            legacy_id: Some(format!("L-{}", id)),
            name: format!("User {}", id),
            email: format!("{}@example.com", id.to_lowercase()),
            package_id: None,
            sponsor_id: sponsor_id.map(str::to_string),
            created_at: registration_day(day),
            updated_at: registration_day(day),
        })
    }

    pub fn insert(&self, user: User) -> User {
        self.state
            .write()
            .unwrap()
            .users
            .insert(user.id.clone(), user.clone());
        user
    }

    pub fn set_package(&self, id: &str, package_id: Option<&str>) {
        if let Some(user) = self.state.write().unwrap().users.get_mut(id) {
            user.package_id = package_id.map(str::to_string);
        }
    }

    /// Writes a sponsor reference without any validation.
    pub fn force_sponsor(&self, id: &str, sponsor_id: Option<&str>) {
        if let Some(user) = self.state.write().unwrap().users.get_mut(id) {
            user.sponsor_id = sponsor_id.map(str::to_string);
        }
    }

    /// Queues a sponsor move that lands between a caller's read and its
    /// next `set_sponsor`, one move per write.
    pub fn move_before_next_write(&self, id: &str, sponsor_id: Option<&str>) {
        self.state
            .write()
            .unwrap()
            .interleaved_moves
            .push_back((id.to_string(), sponsor_id.map(str::to_string)));
    }

    /// Makes every `set_sponsor` wait until `writers` of them are in flight.
    pub fn hold_writes_for(&self, writers: usize) {
        *self.write_gate.lock().unwrap() = Some(Arc::new(Barrier::new(writers)));
    }

    pub fn sponsor_of(&self, id: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .users
            .get(id)
            .and_then(|user| user.sponsor_id.clone())
    }

    pub fn change_count(&self) -> usize {
        self.state.read().unwrap().changes.len()
    }
}

fn ancestors(users: &HashMap<String, User>, user_id: &str, max_hops: i32) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = users.get(user_id).and_then(|u| u.sponsor_id.clone());

    while let Some(sponsor_id) = current {
        if chain.len() as i32 >= max_hops {
            break;
        }
        current = users.get(&sponsor_id).and_then(|u| u.sponsor_id.clone());
        chain.push(sponsor_id);
    }

    chain
}

fn matches_search(user: &User, pattern: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();

    user.name.to_lowercase().contains(&pattern)
        || user.email.to_lowercase().contains(&pattern)
        || user
            .legacy_id
            .as_ref()
            .is_some_and(|legacy| legacy.to_lowercase().contains(&pattern))
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, anyhow::Error> {
        Ok(self.state.read().unwrap().users.get(id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, anyhow::Error> {
        let email = email.trim().to_lowercase();
        Ok(self
            .state
            .read()
            .unwrap()
            .users
            .values()
            .find(|u| u.email.to_lowercase() == email)
            .cloned())
    }

    async fn get_user_by_legacy_id(
        &self,
        legacy_id: &str,
    ) -> Result<Option<User>, anyhow::Error> {
        Ok(self
            .state
            .read()
            .unwrap()
            .users
            .values()
            .find(|u| u.legacy_id.as_deref() == Some(legacy_id.trim()))
            .cloned())
    }

    async fn get_default_root(&self) -> Result<Option<User>, anyhow::Error> {
        Ok(self
            .state
            .read()
            .unwrap()
            .users
            .values()
            .filter(|u| u.sponsor_id.is_none())
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn get_children(&self, parent_ids: &[String]) -> Result<Vec<User>, anyhow::Error> {
        Ok(self
            .state
            .read()
            .unwrap()
            .users
            .values()
            .filter(|u| {
                u.sponsor_id
                    .as_ref()
                    .is_some_and(|sponsor| parent_ids.contains(sponsor))
            })
            .cloned()
            .collect())
    }

    async fn get_ancestor_ids(
        &self,
        user_id: &str,
        max_hops: i32,
    ) -> Result<Vec<String>, anyhow::Error> {
        Ok(ancestors(&self.state.read().unwrap().users, user_id, max_hops))
    }

    async fn downline_counts(
        &self,
        ids: &[String],
        max_depth: i32,
    ) -> Result<HashMap<String, DownlineCount>, anyhow::Error> {
        let state = self.state.read().unwrap();
        let mut counts = HashMap::new();

        for id in ids {
            let mut seen = HashSet::new();
            let mut frontier = vec![id.clone()];
            let mut direct = 0;

            for depth in 1..=max_depth {
                let next: Vec<String> = state
                    .users
                    .values()
                    .filter(|u| {
                        u.sponsor_id
                            .as_ref()
                            .is_some_and(|sponsor| frontier.contains(sponsor))
                    })
                    .map(|u| u.id.clone())
                    .collect();

                if depth == 1 {
                    direct = next.len() as i64;
                }
                if next.is_empty() {
                    break;
                }
                seen.extend(next.iter().cloned());
                frontier = next;
            }

            if direct > 0 {
                counts.insert(
                    id.clone(),
                    DownlineCount {
                        direct,
                        total: seen.len() as i64,
                    },
                );
            }
        }

        Ok(counts)
    }

    async fn list_packages(&self) -> Result<Vec<Package>, anyhow::Error> {
        let mut packages = self.state.read().unwrap().packages.clone();
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }

    async fn search_users(
        &self,
        query: &str,
        limit: i64,
    ) -> Result<Vec<UserMatch>, anyhow::Error> {
        let state = self.state.read().unwrap();
        let mut matches: Vec<UserMatch> = state
            .users
            .values()
            .filter(|u| matches_search(u, query))
            .map(|u| UserMatch {
                id: u.id.clone(),
                email: u.email.clone(),
                name: u.name.clone(),
                legacy_id: u.legacy_id.clone(),
            })
            .collect();
        matches.sort_by(|a, b| a.email.cmp(&b.email));
        matches.truncate(limit.max(0) as usize);

        Ok(matches)
    }

    async fn missing_referrals(
        &self,
        search: Option<&str>,
        filter: &NodeFilter,
        exclude_id: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<User>, i64), anyhow::Error> {
        let state = self.state.read().unwrap();
        let mut users: Vec<User> = state
            .users
            .values()
            .filter(|u| u.sponsor_id.is_none())
            .filter(|u| exclude_id != Some(u.id.as_str()))
            .filter(|u| search.map_or(true, |s| matches_search(u, s)))
            .filter(|u| filter.admits(u))
            .cloned()
            .collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = users.len() as i64;
        let page = users
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok((page, total))
    }

    async fn set_sponsor(
        &self,
        write: &SponsorWrite,
    ) -> Result<SponsorWriteOutcome, anyhow::Error> {
        let gate = self.write_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }

        let mut state = self.state.write().unwrap();

        if let Some((id, sponsor_id)) = state.interleaved_moves.pop_front() {
            if let Some(user) = state.users.get_mut(&id) {
                user.sponsor_id = sponsor_id;
            }
        }

        let current_sponsor = match state.users.get(&write.user_id) {
            Some(user) => user.sponsor_id.clone(),
            None => return Ok(SponsorWriteOutcome::UserMissing),
        };
        if current_sponsor != write.expected_sponsor_id {
            return Ok(SponsorWriteOutcome::Stale);
        }
        if !state.users.contains_key(&write.sponsor_id) {
            return Ok(SponsorWriteOutcome::SponsorMissing);
        }
        if write.sponsor_id == write.user_id
            || ancestors(&state.users, &write.sponsor_id, ANCESTRY_HOP_LIMIT)
                .contains(&write.user_id)
        {
            return Ok(SponsorWriteOutcome::WouldCycle);
        }

        let now = chrono::Utc::now().naive_utc();
        let change = SponsorChange {
            id: format!("change-{}", state.changes.len() + 1),
            user_id: write.user_id.clone(),
            previous_sponsor_id: current_sponsor,
            new_sponsor_id: write.sponsor_id.clone(),
            kind: write.kind.as_str().to_string(),
            created_at: now,
        };
        state.changes.push(change);

        let user = match state.users.get_mut(&write.user_id) {
            Some(user) => user,
            None => return Ok(SponsorWriteOutcome::UserMissing),
        };
        user.sponsor_id = Some(write.sponsor_id.clone());
        user.updated_at = now;

        Ok(SponsorWriteOutcome::Applied(user.clone()))
    }

    async fn sponsor_history(&self, user_id: &str) -> Result<Vec<SponsorChange>, anyhow::Error> {
        Ok(self
            .state
            .read()
            .unwrap()
            .changes
            .iter()
            .rev()
            .filter(|change| change.user_id == user_id)
            .cloned()
            .collect())
    }
}
