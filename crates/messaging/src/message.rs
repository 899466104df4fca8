use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A message handed to a producer.
///
/// The transport does not interpret the body; it is an opaque string produced
/// by the caller's serializer. Properties are flat string pairs that brokers
/// can route or filter on without decoding the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    durable: bool,
    properties: BTreeMap<String, String>,
    body: String,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            durable: false,
            properties: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Mark the message as persistent: the broker must not drop it on restart.
    pub fn set_durable(&mut self, durable: bool) {
        self.durable = durable;
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_body(self) -> String {
        self.body
    }
}

/// A committed message as seen by a consumer of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    address: String,
    message: OutboundMessage,
}

impl Delivery {
    pub fn new(address: impl Into<String>, message: OutboundMessage) -> Self {
        Self {
            address: address.into(),
            message,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    pub fn into_message(self) -> OutboundMessage {
        self.message
    }
}
