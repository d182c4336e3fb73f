//! Handshake captured from the adapter's output

use regex::Captures;

use crate::common::{Error, Result};

/// Capture groups of the matched handshake line
///
/// Group 0 is the whole match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    groups: Vec<Option<String>>,
}

impl Handshake {
    pub(crate) fn from_captures(caps: &Captures<'_>) -> Self {
        Self {
            groups: caps
                .iter()
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect(),
        }
    }

    /// Text of a capture group, if it participated in the match
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }

    pub fn groups(&self) -> &[Option<String>] {
        &self.groups
    }

    /// Port announced in the first capture group
    pub fn port(&self) -> Result<u16> {
        let text = self
            .group(1)
            .ok_or_else(|| Error::Config("handshake pattern has no port group".to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| Error::DapProtocol(format!("Adapter announced an invalid port: {}", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_groups_and_port() {
        let re = Regex::new(r"port (\d+)(?: \((\w+)\))?").unwrap();
        let caps = re.captures("Listening on port 4711\n").unwrap();
        let handshake = Handshake::from_captures(&caps);

        assert_eq!(handshake.group(0), Some("port 4711"));
        assert_eq!(handshake.group(1), Some("4711"));
        assert_eq!(handshake.group(2), None);
        assert_eq!(handshake.group(7), None);
        assert_eq!(handshake.port().unwrap(), 4711);
    }

    #[test]
    fn test_port_errors() {
        let re = Regex::new(r"ready").unwrap();
        let handshake = Handshake::from_captures(&re.captures("ready").unwrap());
        assert!(matches!(handshake.port(), Err(Error::Config(_))));

        let re = Regex::new(r"port (\d+)").unwrap();
        let handshake = Handshake::from_captures(&re.captures("port 99999").unwrap());
        assert!(matches!(handshake.port(), Err(Error::DapProtocol(_))));
    }
}
