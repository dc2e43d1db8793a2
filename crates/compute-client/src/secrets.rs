//! Types for working with cloud access secrets

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Environment variable holding the cloud user name.
pub const ENV_USERNAME: &str = "ARKTOS_CLOUD_USERNAME";
/// Environment variable holding the cloud password.
pub const ENV_PASSWORD: &str = "ARKTOS_CLOUD_PASSWORD";
/// Environment variable holding the project to scope tokens to.
pub const ENV_PROJECT: &str = "ARKTOS_CLOUD_PROJECT";
/// Environment variable holding the domain of the user and the project.
pub const ENV_DOMAIN: &str = "ARKTOS_CLOUD_DOMAIN";

const DEFAULT_PROJECT: &str = "admin";
const DEFAULT_DOMAIN: &str = "default";

/// Password credentials used to obtain identity tokens.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Project the token is scoped to.
    #[serde(default = "default_project")]
    pub project: String,
    /// Domain id of the user and the project.
    #[serde(default = "default_domain")]
    pub domain: String,
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_owned()
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_owned()
}

impl Credentials {
    /// Credentials for a user in the default project and domain.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
            project: default_project(),
            domain: default_domain(),
        }
    }

    /// Reads the credentials from the `ARKTOS_CLOUD_*` environment variables. User name and
    /// password are required.
    pub fn from_env() -> anyhow::Result<Self> {
        let var = |name: &str| {
            std::env::var(name).with_context(|| format!("{} must be set", name))
        };
        Ok(Credentials {
            username: var(ENV_USERNAME)?,
            password: var(ENV_PASSWORD)?,
            project: std::env::var(ENV_PROJECT).unwrap_or_else(|_| default_project()),
            domain: std::env::var(ENV_DOMAIN).unwrap_or_else(|_| default_domain()),
        })
    }

    /// Reads the credentials from a JSON file.
    pub async fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("unable to read credentials file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("invalid credentials file {}", path.display()))
    }

    // The password grant sent to the identity service.
    pub(crate) fn password_grant(&self) -> serde_json::Value {
        serde_json::json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": {"id": self.domain},
                            "password": self.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.project,
                        "domain": {"id": self.domain},
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project", &self.project)
            .field("domain", &self.domain)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_from_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, r#"{"username": "ops", "password": "s3cret"}"#)
            .await
            .unwrap();
        let credentials = Credentials::from_file(&path).await.unwrap();
        assert_eq!(credentials, Credentials::new("ops", "s3cret"));

        tokio::fs::write(&path, r#"{"username": "ops"}"#).await.unwrap();
        assert!(Credentials::from_file(&path).await.is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let rendered = format!("{:?}", Credentials::new("ops", "s3cret"));
        assert!(rendered.contains("ops"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_password_grant() {
        let grant = Credentials::new("ops", "s3cret").password_grant();
        assert_eq!(grant["auth"]["identity"]["methods"][0], "password");
        assert_eq!(grant["auth"]["identity"]["password"]["user"]["name"], "ops");
        assert_eq!(grant["auth"]["scope"]["project"]["name"], "admin");
        assert_eq!(grant["auth"]["scope"]["project"]["domain"]["id"], "default");
    }
}
