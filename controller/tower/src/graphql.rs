use crate::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use trafficredirect_controller_core::Nic;

const NIC_FIELDS: &str = "{id,dpi_enabled,mac_address,vm{id}}";

pub(crate) const NIC_OBJECT: &str = "vmNic";
pub(crate) const NICS_OBJECT: &str = "vmNics";
pub(crate) const LOGIN_OBJECT: &str = "login";

const LOGIN_MUTATION: &str = "mutation Login($data: LoginInput!) { login(data: $data) { token } }";

/// Error codes and message fragments Tower uses when a session token has
/// expired or is otherwise unusable.
const AUTH_ERROR_CODES: &[&str] = &["UNAUTHENTICATED", "LOGIN_REQUIRED"];
const AUTH_ERROR_MESSAGES: &[&str] = &["token expired", "invalid token", "not authenticated"];

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    errors: Vec<ResponseError>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ResponseError {
    pub message: String,
    #[serde(default)]
    pub extensions: Option<ErrorExtensions>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorExtensions {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseErrors(pub Vec<ResponseError>);

#[derive(Debug, Deserialize)]
struct VmNic {
    id: String,
    #[serde(default)]
    dpi_enabled: bool,
    #[serde(default)]
    mac_address: Option<String>,
    #[serde(default)]
    vm: Option<VmRef>,
}

#[derive(Debug, Deserialize)]
struct VmRef {
    id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Login {
    #[serde(default)]
    pub(crate) token: Option<String>,
}

// === impl Request ===

impl Request {
    pub(crate) fn nic(id: &str) -> Self {
        // Serializing the id as a JSON string escapes it for GraphQL as well.
        let id = Value::String(id.to_string());
        Self {
            query: format!("query {{{NIC_OBJECT}(where:{{id:{id}}}) {NIC_FIELDS}}}"),
            variables: None,
        }
    }

    pub(crate) fn nics() -> Self {
        Self {
            query: format!("query {{{NICS_OBJECT} {NIC_FIELDS}}}"),
            variables: None,
        }
    }

    pub(crate) fn login(username: &str, password: &str, source: &str) -> Self {
        Self {
            query: LOGIN_MUTATION.to_string(),
            variables: Some(serde_json::json!({
                "data": {
                    "username": username,
                    "password": password,
                    "source": source,
                },
            })),
        }
    }
}

// === impl Response ===

impl Response {
    /// Returns the response data, failing if the response carries errors.
    pub(crate) fn into_data(self) -> Result<Map<String, Value>> {
        if !self.errors.is_empty() {
            return Err(Error::Query(ResponseErrors(self.errors)));
        }
        Ok(self.data.unwrap_or_default())
    }
}

/// Takes a named object from response data.
///
/// A `null` object is reported as `None`, while a missing object indicates a
/// malformed response.
pub(crate) fn take_object<T: DeserializeOwned>(
    data: &mut Map<String, Value>,
    object: &'static str,
) -> Result<Option<T>> {
    match data.remove(object) {
        None => Err(Error::MissingObject(object)),
        Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| Error::Decode { object, source }),
    }
}

pub(crate) fn take_nic(data: &mut Map<String, Value>) -> Result<Option<Nic>> {
    take_object::<VmNic>(data, NIC_OBJECT).map(|nic| nic.map(Into::into))
}

pub(crate) fn take_nics(data: &mut Map<String, Value>) -> Result<Vec<Nic>> {
    let nics = take_object::<Vec<VmNic>>(data, NICS_OBJECT)?.unwrap_or_default();
    Ok(nics.into_iter().map(Into::into).collect())
}

// === impl ResponseError ===

impl ResponseError {
    fn is_auth(&self) -> bool {
        let code = self
            .extensions
            .as_ref()
            .and_then(|ext| ext.code.as_deref())
            .unwrap_or_default();
        if AUTH_ERROR_CODES.contains(&code) {
            return true;
        }
        let message = self.message.to_ascii_lowercase();
        AUTH_ERROR_MESSAGES.iter().any(|m| message.contains(m))
    }
}

// === impl ResponseErrors ===

impl ResponseErrors {
    pub fn is_auth(&self) -> bool {
        self.0.iter().any(ResponseError::is_auth)
    }
}

impl fmt::Display for ResponseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors = self.0.iter();
        match errors.next() {
            Some(e) => f.write_str(&e.message)?,
            None => return f.write_str("unknown error"),
        }
        for e in errors {
            write!(f, "; {}", e.message)?;
        }
        Ok(())
    }
}

// === impl VmNic ===

impl From<VmNic> for Nic {
    fn from(nic: VmNic) -> Self {
        Nic {
            id: nic.id,
            dpi_enabled: nic.dpi_enabled,
            mac_address: nic.mac_address.unwrap_or_default(),
            owner_vm_id: nic.vm.map(|vm| vm.id).unwrap_or_default(),
        }
    }
}
