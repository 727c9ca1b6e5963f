//! Container user and group string parsing.

use crate::error::{Error, Result};

/// Parses `uid` or `uid:gid`; both parts are non-negative 32-bit
/// integers.
pub fn parse_user(user: &str) -> Result<(u32, Option<u32>)> {
    match user.split_once(':') {
        None => Ok((parse_id(user)?, None)),
        Some((uid, gid)) => Ok((parse_id(uid)?, Some(parse_id(gid)?))),
    }
}

/// Parses a single group id.
pub fn parse_group(group: &str) -> Result<u32> {
    parse_id(group)
}

fn parse_id(s: &str) -> Result<u32> {
    s.parse::<u32>()
        .map_err(|_| Error::InvalidConfig(format!("invalid uid/gid {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user() {
        assert_eq!(parse_user("0").unwrap(), (0, None));
        assert_eq!(parse_user("1000").unwrap(), (1000, None));
        assert_eq!(parse_user("1000:100").unwrap(), (1000, Some(100)));

        assert!(parse_user("").is_err());
        assert!(parse_user("-1").is_err());
        assert!(parse_user("1000:").is_err());
        assert!(parse_user("alice").is_err());
        assert!(parse_user("1000:100:10").is_err());
    }

    #[test]
    fn test_parse_group() {
        assert_eq!(parse_group("27").unwrap(), 27);
        assert!(parse_group("wheel").is_err());
    }
}
