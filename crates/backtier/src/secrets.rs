//! Secret lookup from mounted files and the environment.

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("failed to read secret {name} from {path}: {source}")]
    Read {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secret {0} is empty")]
    Empty(String),
}

pub trait SecretsProvider: Send + Sync {
    fn get(&self, name: &str) -> Result<String, SecretError>;

    /// Like [`get`](Self::get), but absence is not an error.
    fn get_optional(&self, name: &str) -> Result<Option<String>, SecretError> {
        match self.get(name) {
            Ok(value) => Ok(Some(value)),
            Err(SecretError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Looks for `{dir}/{name}` in each directory, then `{env_prefix}{NAME}`.
#[derive(Debug, Clone)]
pub struct FileSecrets {
    dirs: Vec<PathBuf>,
    env_prefix: String,
}

impl FileSecrets {
    pub fn new(dirs: Vec<PathBuf>, env_prefix: impl Into<String>) -> Self {
        Self {
            dirs,
            env_prefix: env_prefix.into(),
        }
    }

    fn env_name(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{suffix}", self.env_prefix)
    }
}

impl SecretsProvider for FileSecrets {
    fn get(&self, name: &str) -> Result<String, SecretError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(SecretError::NotFound(name.to_string()));
        }

        for dir in &self.dirs {
            let path = dir.join(name);
            match std::fs::read_to_string(&path) {
                Ok(contents) => {
                    let value = contents.trim();
                    if value.is_empty() {
                        return Err(SecretError::Empty(name.to_string()));
                    }
                    debug!(secret = %name, path = %path.display(), "Secret loaded from file");
                    return Ok(value.to_string());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(SecretError::Read {
                        name: name.to_string(),
                        path,
                        source,
                    });
                }
            }
        }

        match std::env::var(self.env_name(name)) {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            Ok(_) => Err(SecretError::Empty(name.to_string())),
            Err(_) => Err(SecretError::NotFound(name.to_string())),
        }
    }
}
