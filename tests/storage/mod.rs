//! Shared storage integration tests.
//!
//! Tests the collection, transaction and linking contracts against every
//! backend. Each backend module builds a client and runs these tests.

pub mod collection_tests;
pub mod linking_tests;

use serde::{Deserialize, Serialize};

use chainstore::storage::Payload;

pub const PUBLICATIONS: &str = "publications";
pub const PEOPLE: &str = "people";

/// Collections every backend test client serves.
pub fn collection_names() -> Vec<String> {
    vec![PUBLICATIONS.to_string(), PEOPLE.to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default)]
    pub publications: Vec<String>,
}

/// Publication payload with the given title and no authors.
pub fn publication(title: &str) -> Payload {
    Payload::encode(&Publication {
        title: title.to_string(),
        authors: Vec::new(),
    })
    .expect("publication encodes")
}

/// Person payload with the given name and no publications.
pub fn person(name: &str) -> Payload {
    Payload::encode(&Person {
        name: name.to_string(),
        publications: Vec::new(),
    })
    .expect("person encodes")
}
