//! Wrapper adding the JSON-LD `@context` field to outbound activities/objects.
//!
//!
//! ```
//! # use fedbridge::protocol::context::WithContext;
//! #[derive(serde::Serialize)]
//! struct Note {
//!     content: String,
//! }
//! let with_context = WithContext::new_default(Note { content: "hi".to_string() });
//! let json = serde_json::to_string(&with_context).unwrap();
//! assert_eq!(json, r#"{"@context":["https://www.w3.org/ns/activitystreams"],"content":"hi"}"#);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Wraps a federated struct, adding `@context` on serialization.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WithContext<T> {
    #[serde(rename = "@context")]
    context: Vec<Value>,
    #[serde(flatten)]
    inner: T,
}

impl<T> WithContext<T> {
    /// Wraps `inner` with the single default activitystreams context.
    pub fn new_default(inner: T) -> Self {
        WithContext {
            context: vec![Value::String(DEFAULT_CONTEXT.to_string())],
            inner,
        }
    }

    /// Returns the wrapped value.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Consumes the wrapper, returning the wrapped value.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Dummy {
        content: String,
    }

    #[test]
    fn round_trips_through_json() {
        let wrapped = WithContext::new_default(Dummy {
            content: "hi".to_string(),
        });
        let json = serde_json::to_string(&wrapped).unwrap();
        let parsed: WithContext<Dummy> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.inner().content, "hi");
    }
}
