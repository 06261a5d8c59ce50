use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::users::{Package, User};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Registration,
    Package,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Inclusive registration window, compared on the calendar date.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistrationRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl RegistrationRange {
    pub fn contains(&self, created_at: &NaiveDateTime) -> bool {
        let date = created_at.date();

        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    pub fn is_inverted(&self) -> bool {
        matches!((self.from, self.to), (Some(from), Some(to)) if from > to)
    }
}

/// Visibility filter applied to nodes. Empty `package_ids` admits every node.
#[derive(Clone, Debug, Default)]
pub struct NodeFilter {
    pub package_ids: Vec<String>,
    pub registration: RegistrationRange,
}

impl NodeFilter {
    pub fn admits(&self, user: &User) -> bool {
        let package_ok = self.package_ids.is_empty()
            || user
                .package_id
                .as_ref()
                .is_some_and(|id| self.package_ids.contains(id));

        package_ok && self.registration.contains(&user.created_at)
    }
}

/// Direct referrals and total descendants of one user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownlineCount {
    pub direct: i64,
    pub total: i64,
}

#[derive(Clone, Debug, Default)]
pub struct NetworkQuery {
    pub root_user_id: Option<String>,
    pub email: Option<String>,
    pub depth: Option<i64>,
    pub filter: NodeFilter,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub limit_per_level: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetworkNode {
    pub id: String,
    pub name: String,
    pub email: String,
    pub legacy_id: Option<String>,
    pub package_id: Option<String>,
    pub package_name: Option<String>,
    pub created_at: NaiveDateTime,
    pub sponsor_id: Option<String>,
    pub direct_referrals: i64,
    pub downline_size: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LevelResult {
    pub level: u32,
    /// Visible nodes, capped at the per-level limit.
    pub nodes: Vec<NetworkNode>,
    /// Visible nodes before the cap was applied.
    pub total: usize,
    pub truncated: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NetworkTotals {
    pub total_nodes: usize,
    pub levels: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NetworkSnapshot {
    pub root: NetworkNode,
    pub levels: Vec<LevelResult>,
    pub packages: Vec<Package>,
    pub totals: NetworkTotals,
}

#[derive(Clone, Debug, Default)]
pub struct MissingReferralQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub search: Option<String>,
    pub filter: NodeFilter,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub pages: i64,
    pub page: i64,
    pub page_size: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, page_size: i64) -> Self {
        let pages = if page_size > 0 {
            (total + page_size - 1) / page_size
        } else {
            0
        };

        Page {
            items,
            total,
            pages,
            page,
            page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str) -> NaiveDateTime {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap()
    }

    #[test]
    fn registration_range_is_inclusive_on_both_ends() {
        let range = RegistrationRange {
            from: NaiveDate::from_ymd_opt(2024, 1, 1),
            to: NaiveDate::from_ymd_opt(2024, 1, 31),
        };

        assert!(range.contains(&at("2024-01-01")));
        assert!(range.contains(&at("2024-01-31")));
        assert!(!range.contains(&at("2023-12-31")));
        assert!(!range.contains(&at("2024-02-01")));
        assert!(!range.is_inverted());
    }

    #[test]
    fn inverted_range_is_detected() {
        let range = RegistrationRange {
            from: NaiveDate::from_ymd_opt(2024, 2, 1),
            to: NaiveDate::from_ymd_opt(2024, 1, 1),
        };

        assert!(range.is_inverted());
    }

    #[test]
    fn page_count_rounds_up() {
        let page: Page<()> = Page::new(vec![], 41, 1, 20);
        assert_eq!(page.pages, 3);

        let empty: Page<()> = Page::new(vec![], 0, 1, 20);
        assert_eq!(empty.pages, 0);
    }
}
