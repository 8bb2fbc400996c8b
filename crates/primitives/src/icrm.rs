//! ICRM tags.
//!
//! An ICRM (the typed client-side façade over a CRM) is identified by a
//! `namespace/name/version` tag.

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NoodleError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IcrmTag {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl Display for IcrmTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.version)
    }
}

impl FromStr for IcrmTag {
    type Err = NoodleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [namespace, name, version]
                if !namespace.is_empty() && !name.is_empty() && !version.is_empty() =>
            {
                Ok(Self {
                    namespace: (*namespace).to_owned(),
                    name: (*name).to_owned(),
                    version: (*version).to_owned(),
                })
            }
            _ => Err(NoodleError::Validation(format!(
                "ICRM tag '{s}' is not in the format 'namespace/name/version'"
            ))),
        }
    }
}

impl Serialize for IcrmTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IcrmTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_part_tags() {
        let tag: IcrmTag = "test/INames/0.0.1".parse().unwrap();
        assert_eq!(tag.namespace, "test");
        assert_eq!(tag.name, "INames");
        assert_eq!(tag.version, "0.0.1");
        assert_eq!(tag.to_string(), "test/INames/0.0.1");
    }

    #[test]
    fn rejects_wrong_arity_and_empty_parts() {
        assert!("test/INames".parse::<IcrmTag>().is_err());
        assert!("a/b/c/d".parse::<IcrmTag>().is_err());
        assert!("/INames/0.0.1".parse::<IcrmTag>().is_err());
        assert!("test//0.0.1".parse::<IcrmTag>().is_err());
    }
}
