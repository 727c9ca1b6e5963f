//! String codecs for shared volumes and guest channel sockets.
//!
//! Both forms round-trip through FromStr/Display unchanged, which is
//! what callers embedding them in flat configuration rely on.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One host path shared into the guest under a 9p mount tag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Volume {
    pub mount_tag: String,
    pub host_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volumes(pub Vec<Volume>);

impl FromStr for Volumes {
    type Err = Error;

    /// Parses `"tag1:path1 tag2:path2"`.
    fn from_str(s: &str) -> Result<Self, Error> {
        let mut volumes = Vec::new();
        for part in s.split_whitespace() {
            let (tag, path) = part.split_once(':').ok_or_else(|| {
                Error::InvalidConfig(format!("malformed volume {part:?}"))
            })?;
            if tag.is_empty() || path.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "malformed volume {part:?}"
                )));
            }
            volumes.push(Volume {
                mount_tag: tag.to_string(),
                host_path: PathBuf::from(path),
            });
        }
        Ok(Volumes(volumes))
    }
}

impl fmt::Display for Volumes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|v| format!("{}:{}", v.mount_tag, v.host_path.display()))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// One guest channel socket.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Socket {
    pub device_id: String,
    pub id: String,
    pub host_path: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sockets(pub Vec<Socket>);

impl FromStr for Sockets {
    type Err = Error;

    /// Parses `"devID:id:hostPath:name"`, space-separated. All four
    /// fields are required and non-empty.
    fn from_str(s: &str) -> Result<Self, Error> {
        let mut sockets = Vec::new();
        for part in s.split_whitespace() {
            let fields: Vec<&str> = part.split(':').collect();
            if fields.len() != 4 || fields.iter().any(|f| f.is_empty()) {
                return Err(Error::InvalidConfig(format!(
                    "malformed socket {part:?}"
                )));
            }
            sockets.push(Socket {
                device_id: fields[0].to_string(),
                id: fields[1].to_string(),
                host_path: fields[2].to_string(),
                name: fields[3].to_string(),
            });
        }
        Ok(Sockets(sockets))
    }
}

impl fmt::Display for Sockets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|s| format!("{}:{}:{}:{}", s.device_id, s.id, s.host_path, s.name))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volumes_round_trip() {
        let input = "mountTag1:hostPath1 mountTag2:hostPath2";
        let volumes: Volumes = input.parse().unwrap();
        assert_eq!(volumes.0.len(), 2);
        assert_eq!(volumes.0[0].mount_tag, "mountTag1");
        assert_eq!(volumes.0[1].host_path, PathBuf::from("hostPath2"));
        assert_eq!(volumes.to_string(), input);
    }

    #[test]
    fn test_volumes_reject_malformed() {
        assert!("tagonly".parse::<Volumes>().is_err());
        assert!(":path".parse::<Volumes>().is_err());
        assert!("tag:".parse::<Volumes>().is_err());
    }

    #[test]
    fn test_sockets_round_trip() {
        let input = "devID1:id1:hostPath1:Name1 devID2:id2:hostPath2:Name2";
        let sockets: Sockets = input.parse().unwrap();
        assert_eq!(sockets.0.len(), 2);
        assert_eq!(sockets.0[0].device_id, "devID1");
        assert_eq!(sockets.0[1].name, "Name2");
        assert_eq!(sockets.to_string(), input);
    }

    #[test]
    fn test_sockets_reject_empty_fields() {
        assert!(":::".parse::<Sockets>().is_err());
        assert!("a:b:c".parse::<Sockets>().is_err());
        assert!("a:b:c:d:e".parse::<Sockets>().is_err());
    }
}
