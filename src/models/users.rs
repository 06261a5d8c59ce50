use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub legacy_id: Option<String>,
    pub name: String,
    pub email: String,
    pub package_id: Option<String>,
    pub sponsor_id: Option<String>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct Package {
    pub id: String,
    pub name: String,
}

/// Short form used by the root picker.
#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct UserMatch {
    pub id: String,
    pub email: String,
    pub name: String,
    pub legacy_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserDetails {
    #[serde(flatten)]
    pub user: User,
    pub direct_referrals: i64,
    pub downline_size: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SponsorChangeKind {
    Reassign,
    Resolve,
}

impl SponsorChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SponsorChangeKind::Reassign => "reassign",
            SponsorChangeKind::Resolve => "resolve",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct SponsorChange {
    pub id: String,
    pub user_id: String,
    pub previous_sponsor_id: Option<String>,
    pub new_sponsor_id: String,
    pub kind: String,
    pub created_at: chrono::NaiveDateTime,
}

/// A guarded sponsor write. The store applies it only if the user's sponsor
/// is still `expected_sponsor_id` and `user_id` is not an ancestor of
/// `sponsor_id`.
#[derive(Clone, Debug)]
pub struct SponsorWrite {
    pub user_id: String,
    pub expected_sponsor_id: Option<String>,
    pub sponsor_id: String,
    pub kind: SponsorChangeKind,
}

#[derive(Clone, Debug)]
pub enum SponsorWriteOutcome {
    Applied(User),
    /// The sponsor changed between read and write.
    Stale,
    WouldCycle,
    UserMissing,
    SponsorMissing,
}
