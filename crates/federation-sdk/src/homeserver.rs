use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use crate::FederationError;
use crate::federation::{decode, push_segments};
use crate::types::{AliasResolution, JoinedMembers, MessagesPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationDirection {
    Forward,
    Backward,
}

impl PaginationDirection {
    pub(crate) fn as_query(self) -> &'static str {
        match self {
            PaginationDirection::Forward => "f",
            PaginationDirection::Backward => "b",
        }
    }
}

/// Client-server API access on the operator's own homeserver.
#[derive(Clone)]
pub struct HomeserverClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl HomeserverClient {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, FederationError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn room_messages(
        &self,
        room_id: &str,
        dir: PaginationDirection,
        from: Option<&str>,
        limit: u32,
    ) -> Result<MessagesPage, FederationError> {
        let mut url = self.client_url(&["rooms", room_id, "messages"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("dir", dir.as_query());
            query.append_pair("limit", &limit.to_string());
            if let Some(from) = from {
                query.append_pair("from", from);
            }
        }
        self.get(url).await
    }

    /// Full user ids of everyone currently joined to the room.
    pub async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, FederationError> {
        let url = self.client_url(&["rooms", room_id, "joined_members"])?;
        let members: JoinedMembers = self.get(url).await?;
        Ok(members.joined.into_keys().collect())
    }

    pub async fn resolve_alias(&self, alias: &str) -> Result<AliasResolution, FederationError> {
        let url = self.client_url(&["directory", "room", alias])?;
        self.get(url).await
    }

    fn client_url(&self, segments: &[&str]) -> Result<Url, FederationError> {
        let mut url = self.base_url.clone();
        push_segments(&mut url, &["_matrix", "client", "v3"])?;
        push_segments(&mut url, segments)?;
        Ok(url)
    }

    async fn get<T>(&self, url: Url) -> Result<T, FederationError>
    where
        T: DeserializeOwned,
    {
        tracing::debug!(target = "federation_sdk", url = %url, "GET (client api)");
        let res = self.http.get(url).bearer_auth(&self.token).send().await?;
        Ok(decode::<T>(res).await?.body)
    }
}
