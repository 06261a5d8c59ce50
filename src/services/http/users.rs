use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;

use super::{dispatch, rejection_response, AppState, HttpResult};
use crate::models::{
    network::{
        MissingReferralQuery, NetworkQuery, NetworkSnapshot, NodeFilter, Page, RegistrationRange,
        SortBy, SortOrder,
    },
    users,
};
use crate::services::users::UserRequest;

#[derive(Debug, Default, Deserialize)]
pub struct NetworkParams {
    root_user_id: Option<String>,
    email: Option<String>,
    depth: Option<i64>,
    /// Comma separated.
    package_ids: Option<String>,
    registration_from: Option<NaiveDate>,
    registration_to: Option<NaiveDate>,
    sort_by: Option<SortBy>,
    sort_order: Option<SortOrder>,
    limit_per_level: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MissingReferralParams {
    page: Option<i64>,
    page_size: Option<i64>,
    search: Option<String>,
    package_ids: Option<String>,
    registration_from: Option<NaiveDate>,
    registration_to: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default, alias = "q")]
    query: String,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReassignSponsor {
    new_sponsor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveMissingReferral {
    sponsor_id: String,
}

fn parse_package_ids(raw: Option<String>) -> Vec<String> {
    raw.map(|ids| {
        ids.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn node_filter(
    package_ids: Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> NodeFilter {
    NodeFilter {
        package_ids: parse_package_ids(package_ids),
        registration: RegistrationRange { from, to },
    }
}

pub async fn get_network(
    State(state): State<AppState>,
    params: Result<Query<NetworkParams>, QueryRejection>,
) -> HttpResult<NetworkSnapshot> {
    let Query(params) = params.map_err(rejection_response)?;
    let query = NetworkQuery {
        root_user_id: params.root_user_id,
        email: params.email,
        depth: params.depth,
        filter: node_filter(
            params.package_ids,
            params.registration_from,
            params.registration_to,
        ),
        sort_by: params.sort_by.unwrap_or_default(),
        sort_order: params.sort_order.unwrap_or_default(),
        limit_per_level: params.limit_per_level,
    };

    let network = dispatch(&state.user_channel, |response| UserRequest::GetNetwork {
        query,
        response,
    })
    .await?;

    Ok((StatusCode::OK, Json(network)))
}

pub async fn get_missing_referrals(
    State(state): State<AppState>,
    params: Result<Query<MissingReferralParams>, QueryRejection>,
) -> HttpResult<Page<users::User>> {
    let Query(params) = params.map_err(rejection_response)?;
    let query = MissingReferralQuery {
        page: params.page,
        page_size: params.page_size,
        search: params.search,
        filter: node_filter(
            params.package_ids,
            params.registration_from,
            params.registration_to,
        ),
    };

    let page = dispatch(&state.user_channel, |response| {
        UserRequest::GetMissingReferrals { query, response }
    })
    .await?;

    Ok((StatusCode::OK, Json(page)))
}

pub async fn search_users(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> HttpResult<Vec<users::UserMatch>> {
    let Query(params) = params.map_err(rejection_response)?;
    let matches = dispatch(&state.user_channel, |response| UserRequest::SearchUsers {
        query: params.query,
        limit: params.limit,
        response,
    })
    .await?;

    Ok((StatusCode::OK, Json(matches)))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> HttpResult<users::UserDetails> {
    let user = dispatch(&state.user_channel, |response| UserRequest::GetUser {
        identifier,
        response,
    })
    .await?;

    Ok((StatusCode::OK, Json(user)))
}

pub async fn get_sponsor_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> HttpResult<Vec<users::SponsorChange>> {
    let history = dispatch(&state.user_channel, |response| {
        UserRequest::GetSponsorHistory { user_id, response }
    })
    .await?;

    Ok((StatusCode::OK, Json(history)))
}

pub async fn reassign_sponsor(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    req: Result<Json<ReassignSponsor>, JsonRejection>,
) -> HttpResult<users::User> {
    let Json(req) = req.map_err(rejection_response)?;
    let user = dispatch(&state.user_channel, |response| {
        UserRequest::ReassignSponsor {
            user_id,
            new_sponsor_id: req.new_sponsor_id,
            response,
        }
    })
    .await?;

    Ok((StatusCode::OK, Json(user)))
}

pub async fn resolve_missing_referral(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    req: Result<Json<ResolveMissingReferral>, JsonRejection>,
) -> HttpResult<users::User> {
    let Json(req) = req.map_err(rejection_response)?;
    let user = dispatch(&state.user_channel, |response| {
        UserRequest::ResolveMissingReferral {
            user_id,
            sponsor_id: req.sponsor_id,
            response,
        }
    })
    .await?;

    Ok((StatusCode::OK, Json(user)))
}
