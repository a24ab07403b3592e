//! Queue identity and name-to-URL resolution.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::client::QueueClient;
use crate::errors::SqsListenerError;

/// Logical identity of a queue: either its name or its full URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum QueueRef {
    Name(String),
    Url(String),
}

impl QueueRef {
    /// Parses a string as a URL when it has an `http(s)://` scheme, otherwise as a name.
    pub fn parse(value: &str) -> Self {
        if value.starts_with("https://") || value.starts_with("http://") {
            QueueRef::Url(value.to_string())
        } else {
            QueueRef::Name(value.to_string())
        }
    }

    /// The name or URL as given.
    pub fn as_str(&self) -> &str {
        match self {
            QueueRef::Name(name) => name,
            QueueRef::Url(url) => url,
        }
    }
}

impl From<&str> for QueueRef {
    fn from(value: &str) -> Self {
        QueueRef::parse(value)
    }
}

impl From<String> for QueueRef {
    fn from(value: String) -> Self {
        QueueRef::parse(&value)
    }
}

impl From<&String> for QueueRef {
    fn from(value: &String) -> Self {
        QueueRef::parse(value)
    }
}

impl fmt::Display for QueueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves [`QueueRef`]s to URLs, asking the service once per name.
#[derive(Clone)]
pub struct QueueResolver {
    client: Arc<dyn QueueClient>,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl QueueResolver {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        QueueResolver {
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the URL for `queue`. URLs are returned as-is.
    pub async fn resolve(&self, queue: &QueueRef) -> Result<String, SqsListenerError> {
        let name = match queue {
            QueueRef::Url(url) => return Ok(url.clone()),
            QueueRef::Name(name) => name,
        };

        if let Some(url) = self.cache.read().await.get(name) {
            return Ok(url.clone());
        }

        let url = self.client.get_queue_url(name).await?;
        debug!(queue = %name, url = %url, "Resolved queue url");
        self.cache.write().await.insert(name.clone(), url.clone());
        Ok(url)
    }
}
