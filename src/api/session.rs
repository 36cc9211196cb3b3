//! Session client for the metering API.
//!
//! Logs in once, resolves the caller's virtual entity and lists the metered
//! resources it owns. The token lives only in memory for the process lifetime;
//! nothing here retries.

use serde::Deserialize;
use serde_json::json;

use crate::api::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::{AuthError, ProtocolError};
use crate::models::{Classifier, Credential, EntityId, ResourceMap, Token};

pub const DEFAULT_BASE_URL: &str = "https://api.glowmarkt.com/api/v0-1";
pub const DEFAULT_APPLICATION_ID: &str = "b0f1b774-a586-4f72-9edd-27ead8aa7a8d";

// ---

/// Endpoint settings, built once per run and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSettings {
    pub base_url: String,
    pub application_id: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            application_id: DEFAULT_APPLICATION_ID.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthBody {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntityBody {
    #[serde(rename = "veId")]
    ve_id: String,
}

#[derive(Debug, Deserialize)]
struct ResourcesBody {
    resources: Vec<ResourceBody>,
}

#[derive(Debug, Deserialize)]
struct ResourceBody {
    classifier: String,
    #[serde(rename = "resourceId")]
    resource_id: Option<String>,
}

pub struct SessionClient<T> {
    transport: T,
    settings: ApiSettings,
}

impl<T: Transport> SessionClient<T> {
    pub fn new(transport: T, settings: ApiSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Stamp the fixed headers every call carries, plus the token when given.
    pub(crate) fn stamp(&self, request: ApiRequest, token: Option<&Token>) -> ApiRequest {
        // ---
        let request = request
            .header("Content-Type", "application/json")
            .header("applicationid", self.settings.application_id.as_str());
        match token {
            Some(token) => request.header("token", token.as_str()),
            None => request,
        }
    }

    /// `POST /auth`. A non-2xx status or a body without `token` is an [`AuthError`].
    pub async fn authenticate(&self, credential: &Credential) -> Result<Token, AuthError> {
        // ---
        let body = json!({
            "username": credential.username,
            "password": credential.password(),
        });
        let request = self.stamp(ApiRequest::post("auth", body), None);
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            tracing::error!("Authentication for {} rejected: HTTP {}", credential.username, response.status);
            return Err(AuthError::Rejected {
                status: response.status,
            });
        }

        let token = serde_json::from_str::<AuthBody>(&response.body)
            .ok()
            .and_then(|b| b.token)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        tracing::info!("Authenticated as {}", credential.username);
        Ok(Token::new(token))
    }

    /// `GET /virtualentity`, taking the first entity listed.
    pub async fn resolve_entity(&self, token: &Token) -> Result<EntityId, ProtocolError> {
        // ---
        let path = "virtualentity";
        let response = self.get(path, token).await?;

        let entities: Vec<EntityBody> = parse_body(path, &response)?;
        let first = entities.into_iter().next().ok_or(ProtocolError::NoEntity)?;

        tracing::info!("Resolved virtual entity {}", first.ve_id);
        Ok(EntityId(first.ve_id))
    }

    /// `GET /virtualentity/{id}/resources`, keeping only allow-listed classifiers.
    pub async fn list_resources(
        &self,
        entity_id: &EntityId,
        token: &Token,
    ) -> Result<ResourceMap, ProtocolError> {
        // ---
        let path = format!("virtualentity/{}/resources", entity_id);
        let response = self.get(&path, token).await?;
        let body: ResourcesBody = parse_body(&path, &response)?;

        let mut resources = ResourceMap::new();
        for resource in body.resources {
            let Some(classifier) = Classifier::from_label(&resource.classifier) else {
                tracing::debug!("Ignoring resource with classifier {}", resource.classifier);
                continue;
            };
            let resource_id = resource.resource_id.ok_or_else(|| ProtocolError::Malformed {
                path: path.clone(),
                reason: format!("resource {} has no resourceId", classifier),
            })?;
            resources.insert(classifier, resource_id);
        }

        tracing::info!(
            "Entity {} exposes {} usable resource(s): {:?}",
            entity_id,
            resources.len(),
            resources.keys().map(Classifier::as_str).collect::<Vec<_>>()
        );
        Ok(resources)
    }

    async fn get(&self, path: &str, token: &Token) -> Result<ApiResponse, ProtocolError> {
        // ---
        let request = self.stamp(ApiRequest::get(path), Some(token));
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|source| ProtocolError::Transport {
                path: path.to_string(),
                source,
            })?;

        if !response.is_success() {
            return Err(ProtocolError::Status {
                path: path.to_string(),
                status: response.status,
            });
        }
        Ok(response)
    }
}

fn parse_body<B: serde::de::DeserializeOwned>(
    path: &str,
    response: &ApiResponse,
) -> Result<B, ProtocolError> {
    serde_json::from_str(&response.body).map_err(|e| ProtocolError::Malformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}
