use crate::{
    graphql::{self, Login, Request, Response},
    Error, Result,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};
use trafficredirect_controller_core::{Nic, NicSource};

/// Login credentials for the Tower API.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// The user source, e.g. `LOCAL` or `LDAP`.
    pub source: String,
}

/// A GraphQL client for Tower.
///
/// The client holds a session token that is obtained on first use and
/// refreshed when the server reports that it is no longer valid.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    addr: String,
    url: String,
    credentials: Credentials,
    token: RwLock<Option<String>>,
}

// === impl Credentials ===

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

// === impl Client ===

impl Client {
    /// Builds a client for the Tower instance at `addr` (a `host[:port]`).
    pub fn new(addr: impl ToString, credentials: Credentials, allow_insecure: bool) -> Result<Self> {
        let addr = addr.to_string();
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(allow_insecure)
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                url: format!("https://{addr}/api"),
                addr,
                http,
                credentials,
                token: RwLock::new(None),
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Obtains a new session token, replacing any existing one.
    pub async fn login(&self) -> Result<String> {
        let Credentials {
            username,
            password,
            source,
        } = &self.inner.credentials;
        let req = Request::login(username, password, source);
        let mut data = self.post(&req, None).await?.into_data()?;
        let token = graphql::take_object::<Login>(&mut data, graphql::LOGIN_OBJECT)?
            .and_then(|login| login.token)
            .filter(|token| !token.is_empty())
            .ok_or(Error::MissingToken)?;
        *self.inner.token.write() = Some(token.clone());
        debug!(username, "Logged in");
        Ok(token)
    }

    /// Returns the current session token, logging in if there is none.
    pub async fn token(&self) -> Result<String> {
        if let Some(token) = self.inner.token.read().clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// Fetches a NIC by id, returning `None` if Tower doesn't know it.
    pub async fn vm_nic(&self, id: &str) -> Result<Option<Nic>> {
        let mut data = self.query(&Request::nic(id)).await?;
        graphql::take_nic(&mut data)
    }

    /// Lists all NICs.
    pub async fn vm_nics(&self) -> Result<Vec<Nic>> {
        let mut data = self.query(&Request::nics()).await?;
        graphql::take_nics(&mut data)
    }

    /// Issues a query, logging in again and retrying once if the session
    /// token was rejected.
    async fn query(&self, req: &Request) -> Result<Map<String, Value>> {
        let token = self.token().await?;
        match self.post(req, Some(&token)).await?.into_data() {
            Err(Error::Query(errors)) if errors.is_auth() => {
                warn!(%errors, "Session rejected; logging in again");
                let token = self.login().await?;
                info!("Logged in again");
                self.post(req, Some(&token)).await?.into_data()
            }
            res => res,
        }
    }

    async fn post(&self, req: &Request, token: Option<&str>) -> Result<Response> {
        let mut builder = self.inner.http.post(&self.inner.url).json(req);
        if let Some(token) = token {
            builder = builder.header(reqwest::header::AUTHORIZATION, token);
        }
        let rsp = builder.send().await?;
        Ok(rsp.json::<Response>().await?)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.url)
            .field("credentials", &self.inner.credentials)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl NicSource for Client {
    async fn get_nic(&self, id: &str) -> anyhow::Result<Option<Nic>> {
        Ok(self.vm_nic(id).await?)
    }

    async fn list_nics(&self) -> anyhow::Result<Vec<Nic>> {
        Ok(self.vm_nics().await?)
    }
}
