//! The closed set of broker topics the pipeline consumes from.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A pipeline stage's inbound topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    RemoveBackground,
    ReplaceBackground,
    Upscale,
}

impl Topic {
    /// Every topic, in pipeline order.
    pub const ALL: [Topic; 3] = [Topic::RemoveBackground, Topic::ReplaceBackground, Topic::Upscale];

    /// Wire name of the topic.
    pub const fn as_str(self) -> &'static str {
        match self {
            Topic::RemoveBackground => "remove-background-start",
            Topic::ReplaceBackground => "replace-background-start",
            Topic::Upscale => "upscale-start",
        }
    }

    /// Dense index, used to key per-topic tables.
    pub(crate) const fn index(self) -> usize {
        match self {
            Topic::RemoveBackground => 0,
            Topic::ReplaceBackground => 1,
            Topic::Upscale => 2,
        }
    }

    /// Wire names of every topic, for subscriptions.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|t| t.as_str()).collect()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownTopic(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_parse_back() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
    }

    #[test]
    fn test_unknown_topic_rejected() {
        let err = "resize-start".parse::<Topic>().unwrap_err();
        assert!(matches!(err, Error::UnknownTopic(name) if name == "resize-start"));
        assert!("".parse::<Topic>().is_err());
    }

    #[test]
    fn test_indices_are_dense() {
        let indices: Vec<usize> = Topic::ALL.iter().map(|t| t.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
