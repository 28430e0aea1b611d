// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Consumer tag policies.

use uuid::Uuid;

/// Produces the tag identifying a consumer to the broker.
pub trait ConsumerTagGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Lets the broker assign the tag.
pub struct EmptyTag;

impl ConsumerTagGenerator for EmptyTag {
    fn generate(&self) -> String {
        String::new()
    }
}

/// Always the same caller supplied tag.
pub struct StaticTag(String);

impl StaticTag {
    pub fn new(tag: &str) -> StaticTag {
        StaticTag(tag.to_owned())
    }
}

impl ConsumerTagGenerator for StaticTag {
    fn generate(&self) -> String {
        self.0.clone()
    }
}

/// A prefixed random tag, unique per consumer instance.
pub struct UuidTag {
    prefix: String,
}

impl UuidTag {
    pub fn new(prefix: &str) -> UuidTag {
        UuidTag {
            prefix: prefix.to_owned(),
        }
    }
}

impl ConsumerTagGenerator for UuidTag {
    fn generate(&self) -> String {
        format!("{}-{}", self.prefix, Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_policies() {
        assert_eq!(EmptyTag.generate(), "");
        assert_eq!(StaticTag::new("billing").generate(), "billing");

        let tags = UuidTag::new("worker");
        let (a, b) = (tags.generate(), tags.generate());
        assert!(a.starts_with("worker-"));
        assert_ne!(a, b);
    }
}
