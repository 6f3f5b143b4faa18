//! Disk credentials
//!
//! Credentials are resolved to one variant when a disk is constructed; a
//! backend matches on the variant it understands instead of down-casting.

use cumulus_common::{Error, ProviderType, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Connection and authentication data of a disk
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    Sftp {
        host: String,
        port: u16,
        username: String,
        password: String,
        path: String,
    },
    Ftp {
        host: String,
        port: u16,
        username: String,
        password: String,
        path: String,
    },
    /// Token pair of an OAuth cloud drive (Google Drive, OneDrive)
    #[serde(rename = "oauth")]
    OAuth {
        access_token: String,
        refresh_token: String,
        path: String,
    },
    /// Directory on a locally mounted filesystem
    Local { path: String },
}

impl Credentials {
    /// Parse the serialized form stored in a disk record
    ///
    /// # Errors
    /// Returns `Error::Serialization` if `text` is not a credentials object.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialized form stored in a disk record
    ///
    /// # Errors
    /// Returns `Error::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Directory on the backend that holds this disk's blocks
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Sftp { path, .. }
            | Self::Ftp { path, .. }
            | Self::OAuth { path, .. }
            | Self::Local { path } => Path::new(path),
        }
    }

    /// Whether these credentials can drive a disk of `provider_type`
    #[must_use]
    pub const fn supports(&self, provider_type: ProviderType) -> bool {
        matches!(
            (self, provider_type),
            (Self::Sftp { .. }, ProviderType::Sftp)
                | (Self::Ftp { .. }, ProviderType::Ftp)
                | (
                    Self::OAuth { .. },
                    ProviderType::GDrive | ProviderType::OneDrive
                )
                | (Self::Local { .. }, ProviderType::Local)
        )
    }

    /// Validate the fields a backend needs before it connects
    ///
    /// # Errors
    /// Returns `Error::InvalidArgument` naming the first missing field.
    pub fn authenticate(&self) -> Result<()> {
        let missing = match self {
            Self::Sftp { host, username, .. } | Self::Ftp { host, username, .. } => {
                if host.is_empty() {
                    Some("host")
                } else if username.is_empty() {
                    Some("username")
                } else {
                    None
                }
            }
            Self::OAuth { access_token, .. } => access_token.is_empty().then_some("access_token"),
            Self::Local { path } => path.is_empty().then_some("path"),
        };

        match missing {
            Some(field) => Err(Error::invalid_argument(format!(
                "credentials are missing the {field} field"
            ))),
            None => Ok(()),
        }
    }
}

// Secrets never reach logs
impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sftp {
                host,
                port,
                username,
                path,
                ..
            } => write!(f, "sftp://{username}@{host}:{port}{path}"),
            Self::Ftp {
                host,
                port,
                username,
                path,
                ..
            } => write!(f, "ftp://{username}@{host}:{port}{path}"),
            Self::OAuth { path, .. } => write!(f, "oauth:{path}"),
            Self::Local { path } => write!(f, "file://{path}"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stored_form() {
        let creds = Credentials::parse(
            r#"{"kind":"sftp","host":"files.local","port":22,"username":"bob","password":"hunter2","path":"/data"}"#,
        )
        .unwrap();

        assert!(creds.supports(ProviderType::Sftp));
        assert!(!creds.supports(ProviderType::Ftp));
        assert_eq!(creds.path(), Path::new("/data"));
        assert_eq!(Credentials::parse(&creds.to_json().unwrap()).unwrap(), creds);
    }

    #[test]
    fn test_display_redacts_secrets() {
        let creds = Credentials::Ftp {
            host: "ftp.local".into(),
            port: 21,
            username: "alice".into(),
            password: "s3cret".into(),
            path: "/blocks".into(),
        };
        let shown = format!("{creds} {creds:?}");
        assert!(!shown.contains("s3cret"));
        assert!(shown.contains("ftp://alice@ftp.local:21/blocks"));
    }

    #[test]
    fn test_authenticate_reports_missing_field() {
        let creds = Credentials::OAuth {
            access_token: String::new(),
            refresh_token: "r".into(),
            path: "/".into(),
        };
        let err = creds.authenticate().unwrap_err();
        assert!(err.to_string().contains("access_token"));
        assert!(Credentials::Local { path: "/tmp".into() }.authenticate().is_ok());
    }
}
