//! Console API client.
//!
//! Thin GraphQL client over `reqwest`, authenticated with the cluster's
//! deploy token. Only the queries the bundled reconcilers need live here.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::error::{ConsoleError, Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const NOT_FOUND_MESSAGE: &str = "could not be found";

/// Connection parameters for [`ConsoleClient`].
#[derive(Debug, Clone)]
pub struct ConsoleArgs {
    pub url: String,
    pub deploy_token: String,
}

/// A page of results and the cursor to continue from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NamespaceMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, Value>,
    #[serde(default)]
    pub annotations: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub namespace_metadata: Option<NamespaceMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    pub sync_config: Option<SyncConfig>,
}

/// A namespace the console wants to exist on this cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedNamespace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, Value>>,
    pub service: Option<ServiceTemplate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePage {
    pub page_info: PageInfo,
    pub edges: Vec<NamespaceEdge>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceEdge {
    pub node: ManagedNamespace,
}

#[derive(Serialize)]
struct Request {
    query: &'static str,
    variables: Value,
}

#[derive(Deserialize)]
struct Response<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

const LIST_NAMESPACES: &str = r"
    query ListClusterNamespaces($after: String, $first: Int) {
        clusterManagedNamespaces(after: $after, first: $first) {
            pageInfo { hasNextPage endCursor }
            edges {
                node {
                    id name labels annotations
                    service { syncConfig { namespaceMetadata { labels annotations } } }
                }
            }
        }
    }
";

const GET_NAMESPACE: &str = r"
    query GetManagedNamespace($id: ID!) {
        managedNamespace(id: $id) {
            id name labels annotations
            service { syncConfig { namespaceMetadata { labels annotations } } }
        }
    }
";

/// Authenticated console GraphQL client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConsoleClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ConsoleClient {
    /// Build a client for `{url}/gql` authenticating with `Token {deploy_token}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not a valid header value or the HTTP
    /// client fails to build.
    pub fn new(url: &str, deploy_token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Token {deploy_token}"))
                .map_err(|_| Error::Config("deploy token is not a valid header value".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ConsoleError::from)?;

        Ok(Self {
            client,
            endpoint: format!("{}/gql", url.trim_end_matches('/')),
        })
    }

    pub fn from_args(args: &ConsoleArgs) -> Result<Self> {
        Self::new(&args.url, &args.deploy_token)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// One page of managed namespaces for this cluster.
    pub async fn list_namespaces(
        &self,
        after: Option<&str>,
        first: u32,
    ) -> std::result::Result<NamespacePage, ConsoleError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            cluster_managed_namespaces: Option<NamespacePage>,
        }

        let data: Data = self
            .query(LIST_NAMESPACES, json!({ "after": after, "first": first }))
            .await?;
        Ok(data.cluster_managed_namespaces.unwrap_or_default())
    }

    pub async fn get_namespace(&self, id: &str) -> std::result::Result<ManagedNamespace, ConsoleError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            managed_namespace: Option<ManagedNamespace>,
        }

        let data: Data = self.query(GET_NAMESPACE, json!({ "id": id })).await?;
        data.managed_namespace
            .ok_or_else(|| ConsoleError::NotFound(format!("managed namespace {id}")))
    }

    async fn query<T: DeserializeOwned>(
        &self,
        query: &'static str,
        variables: Value,
    ) -> std::result::Result<T, ConsoleError> {
        let request = Request { query, variables };
        trace!(endpoint = %self.endpoint, "console query");

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "console request failed");
            return Err(ConsoleError::InvalidResponse(format!("HTTP {status}: {body}")));
        }

        let body: Response<T> = response.json().await?;
        if let Some(error) = body.errors.first() {
            if error.message.contains(NOT_FOUND_MESSAGE) {
                return Err(ConsoleError::NotFound(error.message.clone()));
            }
            let messages: Vec<&str> = body.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(ConsoleError::GraphQl(messages.join("; ")));
        }

        body.data
            .ok_or_else(|| ConsoleError::InvalidResponse("response carried no data".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = ConsoleClient::new("https://console.example.com/", "token").unwrap();
        assert_eq!(client.endpoint(), "https://console.example.com/gql");
    }

    #[test]
    fn test_rejects_invalid_token() {
        let err = ConsoleClient::new("https://console.example.com", "bad\ntoken").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_namespace_deserializes_with_optional_fields() {
        let ns: ManagedNamespace = serde_json::from_value(json!({
            "id": "ns-1",
            "name": "apps",
            "labels": { "team": "infra" },
            "annotations": null,
            "service": {
                "syncConfig": {
                    "namespaceMetadata": { "labels": { "managed": "true" } }
                }
            }
        }))
        .unwrap();

        assert_eq!(ns.name, "apps");
        assert!(ns.annotations.is_none());
        let metadata = ns.service.unwrap().sync_config.unwrap().namespace_metadata.unwrap();
        assert_eq!(metadata.labels["managed"], json!("true"));
        assert!(metadata.annotations.is_empty());
    }
}
