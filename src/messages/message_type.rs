/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The `@type` of a message: `<doc-uri><protocol>/<version>/<name>`.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Document URI prefix of the message families defined in this crate.
pub const DIDCOMM_DOC_URI: &str = "https://didcomm.org/";

/// Document URI prefix used by older agents.
pub const SOV_DOC_URI: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageType {
    doc_uri: String,
    protocol: String,
    version: String,
    name: String,
}

impl MessageType {
    pub fn new(doc_uri: &str, protocol: &str, version: &str, name: &str) -> Self {
        Self {
            doc_uri: doc_uri.to_string(),
            protocol: protocol.to_string(),
            version: version.to_string(),
            name: name.to_string(),
        }
    }

    pub fn doc_uri(&self) -> &str {
        &self.doc_uri
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `self` and `other` name the same message of the same protocol, regardless of doc URI.
    /// Versions match when their major components are equal.
    pub fn same_message(&self, other: &MessageType) -> bool {
        self.protocol == other.protocol
            && self.name == other.name
            && major(&self.version) == major(&other.version)
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}",
            self.doc_uri, self.protocol, self.version, self.name
        )
    }
}

impl FromStr for MessageType {
    type Err = MessageTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = s.rsplitn(4, '/');
        let name = segments.next().unwrap_or_default();
        let version = segments.next().unwrap_or_default();
        let protocol = segments.next().unwrap_or_default();
        let prefix = segments
            .next()
            .ok_or_else(|| MessageTypeError(s.to_string()))?;

        if name.is_empty() || version.is_empty() || protocol.is_empty() || prefix.is_empty() {
            return Err(MessageTypeError(s.to_string()));
        }

        Ok(MessageType {
            doc_uri: format!("{prefix}/"),
            protocol: protocol.to_string(),
            version: version.to_string(),
            name: name.to_string(),
        })
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not of the form <doc-uri><protocol>/<version>/<name>")]
pub struct MessageTypeError(String);
