pub use cidr::IpCidr;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
#[error("invalid network {entry:?}: {reason}")]
pub struct CidrParseError {
    pub entry: String,
    pub reason: String,
}

/// A little helper struct to reduce the boilerplate when
/// checking against a list of cidrs
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CidrSet(Vec<IpCidr>);

impl CidrSet {
    pub fn new(set: Vec<IpCidr>) -> Self {
        Self(set)
    }

    /// Parse a whitespace separated list of CIDR entries.
    /// Entries must be proper networks: an entry with host bits set
    /// (eg: `192.168.1.1/24`) is rejected rather than silently masked.
    pub fn parse_list(list: &str) -> Result<Self, CidrParseError> {
        let mut set = vec![];
        for entry in list.split_ascii_whitespace() {
            let cidr = IpCidr::from_str(entry).map_err(|err| CidrParseError {
                entry: entry.to_string(),
                reason: err.to_string(),
            })?;
            set.push(cidr);
        }
        Ok(Self(set))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        for entry in &self.0 {
            if entry.contains(&ip) {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<String>> for CidrSet {
    type Error = CidrParseError;

    fn try_from(v: Vec<String>) -> Result<Self, CidrParseError> {
        Self::parse_list(&v.join(" "))
    }
}

impl From<CidrSet> for Vec<String> {
    fn from(set: CidrSet) -> Vec<String> {
        set.0.iter().map(|cidr| cidr.to_string()).collect()
    }
}
