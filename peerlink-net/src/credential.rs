use std::path::{Path, PathBuf};

/// Opaque relay access token.
///
/// The token is handed to the relay as `Authorization: Bearer <token>` and is
/// never interpreted locally. `Debug` output is redacted so the value can't
/// leak through logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("relay token is empty")]
    Empty,

    #[error("failed to read token from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(Self(token))
    }

    /// Reads a token stored in a file, ignoring surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be read or holds only whitespace.
    #[tracing::instrument]
    pub async fn read_from_file(path: &Path) -> Result<Self, CredentialError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| CredentialError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
        let credential = Self::new(contents)?;
        tracing::debug!("Loaded relay token from file");
        Ok(credential)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Value of the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}
