use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{network::NetworkEngine, RequestHandler, Service, ServiceError};
use crate::{
    models::{
        network::{MissingReferralQuery, NetworkQuery, NetworkSnapshot, Page},
        users,
    },
    repositories::users::UserStore,
    settings::Network,
};

pub enum UserRequest {
    GetNetwork {
        query: NetworkQuery,
        response: oneshot::Sender<Result<NetworkSnapshot, ServiceError>>,
    },
    GetMissingReferrals {
        query: MissingReferralQuery,
        response: oneshot::Sender<Result<Page<users::User>, ServiceError>>,
    },
    SearchUsers {
        query: String,
        limit: Option<i64>,
        response: oneshot::Sender<Result<Vec<users::UserMatch>, ServiceError>>,
    },
    GetUser {
        identifier: String,
        response: oneshot::Sender<Result<users::UserDetails, ServiceError>>,
    },
    GetSponsorHistory {
        user_id: String,
        response: oneshot::Sender<Result<Vec<users::SponsorChange>, ServiceError>>,
    },
    ReassignSponsor {
        user_id: String,
        new_sponsor_id: String,
        response: oneshot::Sender<Result<users::User, ServiceError>>,
    },
    ResolveMissingReferral {
        user_id: String,
        sponsor_id: String,
        response: oneshot::Sender<Result<users::User, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct UserRequestHandler {
    engine: NetworkEngine<dyn UserStore>,
}

impl UserRequestHandler {
    pub fn new<S: UserStore>(repository: S, settings: Network) -> Self {
        let store: Arc<dyn UserStore> = Arc::new(repository);

        UserRequestHandler {
            engine: NetworkEngine::new(store, settings),
        }
    }
}

#[async_trait]
impl RequestHandler<UserRequest> for UserRequestHandler {
    async fn handle_request(&self, request: UserRequest) {
        match request {
            UserRequest::GetNetwork { query, response } => {
                let network = self.engine.get_network(&query).await;
                let _ = response.send(network);
            }
            UserRequest::GetMissingReferrals { query, response } => {
                let page = self.engine.missing_referrals(&query).await;
                let _ = response.send(page);
            }
            UserRequest::SearchUsers {
                query,
                limit,
                response,
            } => {
                let matches = self.engine.search_users(&query, limit).await;
                let _ = response.send(matches);
            }
            UserRequest::GetUser {
                identifier,
                response,
            } => {
                let user = self.engine.get_user_details(&identifier).await;
                let _ = response.send(user);
            }
            UserRequest::GetSponsorHistory { user_id, response } => {
                let history = self.engine.sponsor_history(&user_id).await;
                let _ = response.send(history);
            }
            UserRequest::ReassignSponsor {
                user_id,
                new_sponsor_id,
                response,
            } => {
                let user = self.engine.reassign_sponsor(&user_id, &new_sponsor_id).await;
                if let Err(e) = &user {
                    log::warn!("Could not reassign sponsor of {}: {}", user_id, e);
                }
                let _ = response.send(user);
            }
            UserRequest::ResolveMissingReferral {
                user_id,
                sponsor_id,
                response,
            } => {
                let user = self
                    .engine
                    .resolve_missing_referral(&user_id, &sponsor_id)
                    .await;
                if let Err(e) = &user {
                    log::warn!("Could not resolve missing referral {}: {}", user_id, e);
                }
                let _ = response.send(user);
            }
        }
    }
}

pub struct UserService;

impl UserService {
    pub fn new() -> Self {
        UserService {}
    }
}

#[async_trait]
impl Service<UserRequest, UserRequestHandler> for UserService {}
