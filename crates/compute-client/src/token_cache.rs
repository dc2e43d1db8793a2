use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

/// Identity tokens by cloud host. Tokens are kept until the cloud rejects them.
#[derive(Default)]
pub(crate) struct TokenCache {
    tokens: Mutex<HashMap<String, String>>,
}

impl TokenCache {
    pub(crate) async fn insert(&self, host: &str, token: String) {
        debug!(%host, "inserting token");
        self.tokens.lock().await.insert(host.to_owned(), token);
    }

    pub(crate) async fn get(&self, host: &str) -> Option<String> {
        let token = self.tokens.lock().await.get(host).cloned();
        debug!(%host, miss = token.is_none(), "fetching token");
        token
    }

    pub(crate) async fn remove(&self, host: &str) {
        self.tokens.lock().await.remove(host);
    }
}
